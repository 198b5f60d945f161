//! A device with no hardware behind it.
//!
//! Always connected. Its resources are whatever the options list, either as
//! plain ids or as objects with an `id`:
//!
//! ```json
//! {"type": "virtual", "resources": ["amb", {"id": "go1080p25", "displayName": "GO", "duration": 250}]}
//! ```

use async_trait::async_trait;
use cueproto::{DeviceOptions, Resource};
use serde_json::Value;

use crate::device::{Device, DeviceError, DeviceHealth, HealthReporter};

pub struct VirtualDevice {
    resources: Vec<Resource>,
}

impl VirtualDevice {
    pub fn new(device_id: &str, options: &DeviceOptions, reporter: HealthReporter) -> Result<Self, DeviceError> {
        let resources = match options.get("resources") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .map(|entry| parse_resource(device_id, entry))
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(DeviceError::InvalidOptions(format!(
                    "resources must be a list, got {}",
                    other
                )))
            }
        };

        reporter.report(DeviceHealth::good("Connected"));
        Ok(Self { resources })
    }
}

fn parse_resource(device_id: &str, entry: &Value) -> Result<Resource, DeviceError> {
    match entry {
        Value::String(id) => Ok(Resource::new(id.as_str(), device_id, id.as_str())),
        Value::Object(fields) => {
            let mut fields = fields.clone();
            let id = fields
                .remove("id")
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| DeviceError::InvalidOptions("resource without an id".to_string()))?;
            let display_name = fields
                .remove("displayName")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| id.clone());
            fields.remove("deviceId");

            let mut resource = Resource::new(id, device_id, display_name);
            resource.fields = fields;
            Ok(resource)
        }
        other => Err(DeviceError::InvalidOptions(format!("bad resource entry {}", other))),
    }
}

#[async_trait]
impl Device for VirtualDevice {
    async fn resources(&self) -> Result<Vec<Resource>, DeviceError> {
        Ok(self.resources.clone())
    }

    async fn close(&self) {}
}
