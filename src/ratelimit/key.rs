//! Runtime key generation and handling.

/// A key that identifies one client hitting one endpoint.
///
/// Each distinct key gets its own bucket under a configured limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    /// The caller (user id, API key, remote address, ...)
    pub client_id: String,
    /// The endpoint or resource being accessed
    pub endpoint: String,
}

impl RequestKey {
    /// Create a new request key.
    pub fn new(client_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Convert the key to the string the limiter buckets by.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.client_id, self.endpoint)
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.client_id, self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_to_string() {
        let key = RequestKey::new("tenant-7", "/api/orders");
        assert_eq!(key.to_string_key(), "tenant-7:/api/orders");
        assert_eq!(key.to_string(), key.to_string_key());
    }

    #[test]
    fn test_request_key_equality() {
        let key1 = RequestKey::new("client", "/checkout");
        let key2 = RequestKey::new("client", "/checkout");
        let key3 = RequestKey::new("client", "/cart");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }
}
