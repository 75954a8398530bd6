use serde::Serialize;

/// Ordered, duplicate-free list of endpoint addresses for one service.
///
/// Order matters for round-robin reproducibility: the first address pushed is
/// the first one a fresh round-robin cursor returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EndpointPool {
    endpoints: Vec<String>,
}

impl EndpointPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool, keeping the first occurrence of any repeated address
    pub fn from_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pool = Self::new();
        for endpoint in endpoints {
            pool.insert(endpoint);
        }
        pool
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.endpoints.iter().any(|existing| existing == endpoint)
    }

    /// Append an address. Returns `false` if it was already present.
    pub fn insert<S: Into<String>>(&mut self, endpoint: S) -> bool {
        let endpoint = endpoint.into();
        if self.contains(&endpoint) {
            return false;
        }
        self.endpoints.push(endpoint);
        true
    }

    /// Remove an address. Returns `false` if it was not present.
    pub fn remove(&mut self, endpoint: &str) -> bool {
        match self.endpoints.iter().position(|existing| existing == endpoint) {
            Some(index) => {
                self.endpoints.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.endpoints.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.endpoints
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.endpoints.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_endpoints_deduplicates_in_order() {
        let pool = EndpointPool::from_endpoints(["a:80", "b:80", "a:80", "c:80"]);
        assert_eq!(pool.as_slice(), &["a:80", "b:80", "c:80"]);
    }

    #[test]
    fn test_insert_and_remove_are_idempotent() {
        let mut pool = EndpointPool::new();
        assert!(pool.insert("10.0.0.1:80"));
        assert!(!pool.insert("10.0.0.1:80"));
        assert_eq!(pool.len(), 1);

        assert!(pool.remove("10.0.0.1:80"));
        assert!(!pool.remove("10.0.0.1:80"));
        assert!(pool.is_empty());
    }
}
