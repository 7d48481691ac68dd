use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Kind of real-world entity an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Exchange,
    MiningPool,
    TreasuryHolder,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Exchange => "exchange",
            EntityKind::MiningPool => "mining_pool",
            EntityKind::TreasuryHolder => "treasury_holder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exchange" => Some(EntityKind::Exchange),
            "mining_pool" => Some(EntityKind::MiningPool),
            "treasury_holder" => Some(EntityKind::TreasuryHolder),
            _ => None,
        }
    }
}

/// A known real-world entity and its associated addresses. Reference data,
/// refreshed out of band, never written by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    pub addresses: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

/// In-memory address → entity index. Built once at startup (optionally
/// rebuilt on a slow refresh interval); resolution is a pure O(1) lookup
/// with no network calls. Not-found is not an error.
pub struct EntityResolver {
    by_address: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
    records: Vec<EntityRecord>,
}

impl EntityResolver {
    pub fn from_records(records: Vec<EntityRecord>) -> Self {
        let mut by_address = HashMap::new();
        let mut by_id = HashMap::new();
        for (idx, rec) in records.iter().enumerate() {
            by_id.insert(rec.id.clone(), idx);
            for addr in &rec.addresses {
                by_address.insert(addr.clone(), idx);
            }
        }
        tracing::info!(
            entities = records.len(),
            addresses = by_address.len(),
            "entity index built"
        );
        Self {
            by_address,
            by_id,
            records,
        }
    }

    pub fn empty() -> Self {
        Self::from_records(Vec::new())
    }

    pub fn resolve(&self, address: &str) -> Option<&EntityRecord> {
        self.by_address
            .get(address)
            .map(|&idx| &self.records[idx])
    }

    pub fn resolve_entity_id(&self, id: &str) -> Option<&EntityRecord> {
        self.by_id.get(id).map(|&idx| &self.records[idx])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(id: &str, addrs: &[&str]) -> EntityRecord {
        EntityRecord {
            id: id.to_string(),
            name: id.to_uppercase(),
            kind: EntityKind::Exchange,
            addresses: addrs.iter().map(|a| a.to_string()).collect(),
            metadata: None,
        }
    }

    #[test]
    fn resolves_any_associated_address() {
        let resolver = EntityResolver::from_records(vec![
            exchange("binance", &["addr1", "addr2"]),
            exchange("kraken", &["addr3"]),
        ]);
        assert_eq!(resolver.resolve("addr1").unwrap().id, "binance");
        assert_eq!(resolver.resolve("addr2").unwrap().id, "binance");
        assert_eq!(resolver.resolve("addr3").unwrap().id, "kraken");
    }

    #[test]
    fn unknown_address_is_none_not_error() {
        let resolver = EntityResolver::from_records(vec![exchange("binance", &["addr1"])]);
        assert!(resolver.resolve("unknown").is_none());
    }

    #[test]
    fn empty_resolver() {
        let resolver = EntityResolver::empty();
        assert!(resolver.is_empty());
        assert!(resolver.resolve("anything").is_none());
    }

    #[test]
    fn kind_roundtrip() {
        for kind in [
            EntityKind::Exchange,
            EntityKind::MiningPool,
            EntityKind::TreasuryHolder,
        ] {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("other"), None);
    }
}
