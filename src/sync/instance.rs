use std::time::Duration;

use serde::Serialize;

/// One process's view of its rank, peer count and assigned offset.
///
/// Owned by the coordinator; consumers only ever receive clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    /// Health-marker key identifying this process.
    pub id: String,
    /// 0-based rank in the shared list, `-1` until registered.
    pub position: i64,
    /// Number of live peers, including this one.
    pub count: i64,
    /// Phase inside the cadence window.  `None` until first computed.
    #[serde(serialize_with = "serialize_offset")]
    pub offset: Option<Duration>,
    #[serde(serialize_with = "serialize_secs")]
    pub cadence: Duration,
}

impl Instance {
    pub fn new(id: String, cadence: Duration) -> Self {
        Self {
            id,
            position: -1,
            count: 0,
            offset: None,
            cadence,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.position >= 0
    }
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

fn serialize_offset<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs()),
        None => s.serialize_none(),
    }
}
