use serde::{Deserialize, Serialize};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub user_name: &'a str,
    pub password: &'a str,
    pub login_msg_ack: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(rename = "sessionID")]
    pub session_id: String,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    #[serde(default)]
    pub error_code: Option<String>,

    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Deserialize)]
pub struct Collection<T> {
    #[serde(default = "Vec::new")]
    pub members: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHardware {
    pub uuid: String,

    pub status: String,

    pub modified: String,

    #[serde(default)]
    pub port_map: Option<PortMap>,
}

impl ServerHardware {
    /// Whether a physical port, or one of its virtual ports, carries `mac`.
    pub fn has_mac(&self, mac: &str) -> bool {
        self.port_map
            .iter()
            .flat_map(|map| map.device_slots.iter())
            .flat_map(|slot| slot.physical_ports.iter())
            .any(|port| {
                port.mac
                    .as_deref()
                    .is_some_and(|m| m.eq_ignore_ascii_case(mac))
                    || port
                        .virtual_ports
                        .iter()
                        .any(|vport| vport.mac.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(mac)))
            })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMap {
    #[serde(default)]
    pub device_slots: Vec<DeviceSlot>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSlot {
    #[serde(default)]
    pub physical_ports: Vec<PhysicalPort>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalPort {
    #[serde(default)]
    pub mac: Option<String>,

    #[serde(default)]
    pub virtual_ports: Vec<VirtualPort>,
}

#[derive(Deserialize)]
pub struct VirtualPort {
    #[serde(default)]
    pub mac: Option<String>,
}

#[derive(Deserialize)]
pub struct Alert {
    pub uri: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    #[serde(rename = "base64SSLCertData")]
    pub certificate: String,

    #[serde(rename = "base64SSLKeyData")]
    pub key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequest<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,

    pub common_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EulaAcceptance<'a> {
    pub support_access: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mac_matches_physical_and_virtual_ports() {
        let server: ServerHardware = serde_json::from_value(json!({
            "uuid": "sh-1",
            "status": "OK",
            "modified": "2016-03-03T18:02:41.379Z",
            "portMap": {
                "deviceSlots": [{
                    "physicalPorts": [{
                        "mac": "AA:BB:CC:00:00:01",
                        "virtualPorts": [{ "mac": "AA:BB:CC:00:00:02" }]
                    }]
                }]
            }
        }))
        .unwrap();

        assert!(server.has_mac("aa:bb:cc:00:00:01"));
        assert!(server.has_mac("AA:BB:CC:00:00:02"));
        assert!(!server.has_mac("AA:BB:CC:00:00:03"));
    }

    #[test]
    fn test_server_without_port_map() {
        let server: ServerHardware = serde_json::from_value(json!({
            "uuid": "sh-1",
            "status": "OK",
            "modified": "2016-03-03T18:02:41.379Z",
            "portMap": null
        }))
        .unwrap();

        assert!(!server.has_mac("aa:bb:cc:00:00:01"));
    }
}
