use crate::attribute_store::{AttributeEntry, AttributeStore, AttributeValue, StoreError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Status returned by a successful `SetValue`
pub const SET_VALUE_OK: i32 = 0;

/// Request/response surface bus callers use. Each call takes the store lock
/// for its own duration only.
#[derive(Debug, Clone)]
pub struct BusPeer {
    store: Arc<AttributeStore>,
}

impl BusPeer {
    pub fn new(store: Arc<AttributeStore>) -> Self {
        Self { store }
    }

    pub fn get_value(&self, path: &str) -> Result<AttributeValue, StoreError> {
        tracing::debug!("GetValue() called for {path}");
        let value = self.store.get(path)?.value;
        tracing::debug!("...returning {value}");
        Ok(value)
    }

    pub fn get_text(&self, path: &str) -> Result<String, StoreError> {
        tracing::debug!("GetText() called for {path}");
        let text = self.store.get(path)?.text;
        tracing::debug!("...returning {text}");
        Ok(strip_quotes(&text).to_string())
    }

    /// Local override: stored as-is, nothing is re-published
    pub fn set_value(&self, path: &str, value: AttributeValue) -> Result<i32, StoreError> {
        tracing::debug!("SetValue() called for {path} with value {value}");
        self.store.set_raw(path, value)?;
        Ok(SET_VALUE_OK)
    }

    pub fn get_items(&self) -> Result<BTreeMap<String, AttributeEntry>, StoreError> {
        tracing::debug!("GetItems() called");
        self.store.snapshot_all()
    }
}

/// Variant string renderings come back wrapped in quotes
fn strip_quotes(text: &str) -> &str {
    text.trim_matches('"')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute_store::format_measurement;
    use crate::grid_meter;

    fn peer() -> (BusPeer, Arc<AttributeStore>) {
        let store = Arc::new(AttributeStore::new());
        grid_meter::initialize(&store);
        (BusPeer::new(store.clone()), store)
    }

    #[test]
    fn test_get_value_and_text() {
        let (peer, _) = peer();
        assert_eq!(peer.get_value("/DeviceType").unwrap(), AttributeValue::Int(71));
        assert_eq!(peer.get_text("/ProductName").unwrap(), "Grid meter");
        assert_eq!(peer.get_text("/Ac/L1/Voltage").unwrap(), "230 V");
    }

    #[test]
    fn test_text_matches_last_measurement() {
        let (peer, store) = peer();
        store.apply_measurement("/Ac/L2/Power", 123.456, "W", 2).unwrap();
        assert_eq!(
            peer.get_text("/Ac/L2/Power").unwrap(),
            format_measurement(123.456, "W", 2)
        );
    }

    #[test]
    fn test_quotes_are_stripped() {
        let (peer, store) = peer();
        store.initialize([("/CustomName", AttributeEntry::new("x", "\"Shed meter\""))]);
        assert_eq!(peer.get_text("/CustomName").unwrap(), "Shed meter");
    }

    #[test]
    fn test_set_value() {
        let (peer, _) = peer();
        assert_eq!(
            peer.set_value("/CustomName", "Main".into()).unwrap(),
            SET_VALUE_OK
        );
        assert_eq!(
            peer.get_value("/CustomName").unwrap(),
            AttributeValue::Text("Main".to_string())
        );
    }

    #[test]
    fn test_set_value_on_unpublished_path_fails() {
        let (peer, _) = peer();
        assert_eq!(
            peer.set_value("/Ac/L4/Power", AttributeValue::Double(1.0)),
            Err(StoreError::UnknownPath("/Ac/L4/Power".to_string()))
        );
        assert_eq!(peer.get_items().unwrap().len(), grid_meter::published_paths().len());
    }

    #[test]
    fn test_get_items_covers_every_path() {
        let (peer, _) = peer();
        let items = peer.get_items().unwrap();
        assert_eq!(items.len(), grid_meter::published_paths().len());
        assert_eq!(items["/Serial"].text, "BP98305081235");
    }

    #[test]
    fn test_calls_before_initialization_fail() {
        let peer = BusPeer::new(Arc::new(AttributeStore::new()));
        assert_eq!(peer.get_value("/Serial"), Err(StoreError::NotInitialized));
        assert_eq!(peer.get_text("/Serial"), Err(StoreError::NotInitialized));
        assert_eq!(
            peer.set_value("/Serial", "x".into()),
            Err(StoreError::NotInitialized)
        );
        assert_eq!(peer.get_items(), Err(StoreError::NotInitialized));
    }
}
