pub mod interaction;
pub mod tool_call;

pub use interaction::InteractionRecord;
pub use tool_call::ToolCallRecord;

/// Serde helpers for durations carried as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod map {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use std::collections::BTreeMap;
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            m: &BTreeMap<String, Duration>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            let as_ms: BTreeMap<&str, u64> = m
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_millis().min(u64::MAX as u128) as u64))
                .collect();
            as_ms.serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<BTreeMap<String, Duration>, D::Error> {
            let as_ms = BTreeMap::<String, u64>::deserialize(d)?;
            Ok(as_ms
                .into_iter()
                .map(|(k, v)| (k, Duration::from_millis(v)))
                .collect())
        }
    }
}

/// Milliseconds as stored in the INTEGER duration columns.
pub fn duration_ms(d: std::time::Duration) -> i32 {
    i32::try_from(d.as_millis()).unwrap_or(i32::MAX)
}
