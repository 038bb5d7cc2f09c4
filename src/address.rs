//! Endpoint addresses: `host:service:endpoint-id`, compared lexicographically
//! on their encoded wire bytes (spec.md §3, §6).

use std::cmp::Ordering;
use std::fmt;

use crate::error::AddressParseError;

/// An opaque identifier for one [`LocalEndPoint`](crate::local::LocalEndPoint),
/// encoding `host:service:endpoint-id`.
///
/// Host and service never contain `:`; `endpoint_id` is non-negative.
#[derive(Clone, Debug, Eq)]
pub struct EndPointAddress {
    host: String,
    service: String,
    endpoint_id: i32,
}

impl EndPointAddress {
    pub fn new(host: impl Into<String>, service: impl Into<String>, endpoint_id: i32) -> Self {
        EndPointAddress {
            host: host.into(),
            service: service.into(),
            endpoint_id,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn endpoint_id(&self) -> i32 {
        self.endpoint_id
    }

    /// `host:service:decimal-endpoint-id`, as sent on the wire.
    pub fn encode(&self) -> Vec<u8> {
        format!("{}:{}:{}", self.host, self.service, self.endpoint_id).into_bytes()
    }

    pub fn try_decode(bytes: &[u8]) -> Result<Self, AddressParseError> {
        let text = std::str::from_utf8(bytes).map_err(|_| AddressParseError::NotUtf8)?;
        let mut parts = text.rsplitn(3, ':');
        let endpoint_id = parts
            .next()
            .ok_or(AddressParseError::Malformed)?
            .parse::<i32>()
            .map_err(|_| AddressParseError::Malformed)?;
        let service = parts.next().ok_or(AddressParseError::Malformed)?;
        let host = parts.next().ok_or(AddressParseError::Malformed)?;
        if endpoint_id < 0 {
            return Err(AddressParseError::Malformed);
        }
        Ok(EndPointAddress::new(host, service, endpoint_id))
    }
}

impl fmt::Display for EndPointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.service, self.endpoint_id)
    }
}

impl PartialEq for EndPointAddress {
    fn eq(&self, other: &Self) -> bool {
        self.encode() == other.encode()
    }
}

impl std::hash::Hash for EndPointAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.encode().hash(state);
    }
}

impl PartialOrd for EndPointAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EndPointAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.encode().cmp(&other.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_wire_form() {
        let addr = EndPointAddress::new("127.0.0.1", "9000", 3);
        let decoded = EndPointAddress::try_decode(&addr.encode()).unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn orders_lexicographically_on_encoded_bytes() {
        let a = EndPointAddress::new("10.0.0.1", "9000", 0);
        let b = EndPointAddress::new("10.0.0.2", "9000", 0);
        assert!(a < b);
        assert_eq!(a.encode().cmp(&b.encode()), a.cmp(&b));
    }

    #[test]
    fn rejects_malformed_wire_bytes() {
        assert!(EndPointAddress::try_decode(b"no-separators").is_err());
        assert!(EndPointAddress::try_decode(b"host:service:-1").is_err());
    }
}
