use ovm_model::ResourceId;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Envelope {
    resource: ResourceChange,
}

/// The part of a server hardware update the listener reads.
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct ResourceChange {
    /// Server hardware UUID.
    pub uuid: ResourceId,

    /// Appliance status string.
    pub status: String,

    /// Modification timestamp, as sent by the appliance.
    pub modified: String,
}

/// Parses a state-change message body.
pub fn parse(body: &[u8]) -> Result<ResourceChange, serde_json::Error> {
    serde_json::from_slice::<Envelope>(body).map(|envelope| envelope.resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reads_resource_fields() {
        let body = br#"{"resource": {"uuid": "sh-1", "status": "Critical",
            "modified": "2016-03-03T18:02:41.379Z", "name": "enc1, bay 1"},
            "changeType": "Updated"}"#;

        let change = parse(body).unwrap();

        assert_eq!(change.uuid, ResourceId::from("sh-1"));
        assert_eq!(change.status, "Critical");
        assert_eq!(change.modified, "2016-03-03T18:02:41.379Z");
    }

    #[test]
    fn test_parse_rejects_missing_resource() {
        assert!(parse(br#"{"changeType": "Updated"}"#).is_err());
    }
}
