use serde_json::Value;

use crate::client::{ApiClient, ApiError, ApiRequest};

/// Collections exposed by the clinic API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Patients,
    Visits,
    Billing,
    Staff,
    Inventory,
    Notifications,
    Lab,
    Consultations,
    Appointments,
    Ultrasound,
    MedicalDocuments,
}

impl Resource {
    pub fn base_path(self) -> &'static str {
        match self {
            Resource::Patients => "/patients/",
            Resource::Visits => "/visits/",
            Resource::Billing => "/billing/invoices/",
            Resource::Staff => "/staff/",
            Resource::Inventory => "/inventory/",
            Resource::Notifications => "/notifications/",
            Resource::Lab => "/lab/",
            Resource::Consultations => "/consultations/",
            Resource::Appointments => "/appointments/",
            Resource::Ultrasound => "/ultrasound/",
            Resource::MedicalDocuments => "/medical-documents/",
        }
    }

    /// Every cached read of this collection has a key containing this.
    pub fn cache_prefix(self) -> &'static str {
        self.base_path()
            .trim_matches('/')
            .split('/')
            .next()
            .unwrap_or_default()
    }

    fn item_path(self, id: u64) -> String {
        format!("{}{}/", self.base_path(), id)
    }
}

/// CRUD helpers for one collection. Reads are cacheable; writes go through
/// the pipeline and invalidate the collection before returning.
#[derive(Debug, Clone, Copy)]
pub struct Resources<'a> {
    client: &'a ApiClient,
    resource: Resource,
}

impl ApiClient {
    pub fn resource(&self, resource: Resource) -> Resources<'_> {
        Resources {
            client: self,
            resource,
        }
    }
}

impl Resources<'_> {
    pub async fn list(&self, filters: &[(&str, &str)]) -> Result<Value, ApiError> {
        let mut request = ApiRequest::get(self.resource.base_path()).cacheable();
        for (key, value) in filters {
            request = request.query(*key, *value);
        }
        self.client.request(request).await
    }

    pub async fn get(&self, id: u64) -> Result<Value, ApiError> {
        let request = ApiRequest::get(self.resource.item_path(id)).cacheable();
        self.client.request(request).await
    }

    pub async fn create(&self, body: Value) -> Result<Value, ApiError> {
        self.write(ApiRequest::post(self.resource.base_path()).json(body))
            .await
    }

    pub async fn update(&self, id: u64, body: Value) -> Result<Value, ApiError> {
        self.write(ApiRequest::put(self.resource.item_path(id)).json(body))
            .await
    }

    pub async fn patch(&self, id: u64, body: Value) -> Result<Value, ApiError> {
        self.write(ApiRequest::patch(self.resource.item_path(id)).json(body))
            .await
    }

    pub async fn delete(&self, id: u64) -> Result<(), ApiError> {
        self.write(ApiRequest::delete(self.resource.item_path(id)))
            .await
            .map(|_| ())
    }

    async fn write(&self, request: ApiRequest) -> Result<Value, ApiError> {
        self.client
            .request(request.invalidates(self.resource.cache_prefix()))
            .await
    }
}
