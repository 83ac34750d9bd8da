//! Identifier and record types for partitioned streams.
//!
//! Identifiers are opaque tagged strings: two values compare equal exactly
//! when their underlying strings do, and no other operations are defined
//! on them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

macro_rules! tagged_string {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

tagged_string! {
    /// Name of an upstream stream.
    StreamName
}

tagged_string! {
    /// Identifier of one shard (partition) of a stream.
    ShardId
}

tagged_string! {
    /// Identifier of a worker node. Ownership of a shard lease is keyed on
    /// this value.
    WorkerId
}

tagged_string! {
    /// Name of the state table backing an application.
    TableName
}

tagged_string! {
    /// Per-shard, strictly-increasing record identifier assigned by the
    /// upstream service. Opaque to this library.
    SequenceNumber
}

tagged_string! {
    /// Name of a consumer application. At most one running application per
    /// name per process.
    AppName
}

tagged_string! {
    /// Opaque cursor returned by the stream service. Positions the next
    /// fetch; the only legal continuation after a batch.
    ContinuationToken
}

/// Where to position a freshly obtained shard iterator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IteratorPosition {
    /// Oldest record still retained by the upstream service.
    TrimHorizon,
    /// Exactly at the given sequence number.
    AtSequenceNumber(SequenceNumber),
    /// Immediately after the given sequence number.
    AfterSequenceNumber(SequenceNumber),
    /// Resume from a token previously returned by the stream service.
    ContinuationToken(ContinuationToken),
}

impl std::fmt::Display for IteratorPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrimHorizon => write!(f, "trim-horizon"),
            Self::AtSequenceNumber(seq) => write!(f, "at-sequence-number({seq})"),
            Self::AfterSequenceNumber(seq) => write!(f, "after-sequence-number({seq})"),
            Self::ContinuationToken(_) => write!(f, "continuation-token"),
        }
    }
}

/// One record of a shard. Immutable; ordered within its shard by ascending
/// sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Partition key the producer supplied.
    pub partition_key: String,
    /// Sequence number assigned by the upstream service.
    pub sequence_number: SequenceNumber,
    /// Record payload.
    pub data: Bytes,
}

impl Record {
    pub fn new(
        partition_key: impl Into<String>,
        sequence_number: impl Into<SequenceNumber>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            partition_key: partition_key.into(),
            sequence_number: sequence_number.into(),
            data: data.into(),
        }
    }
}

/// One fetch result: an ordered run of records plus the continuation for
/// the next fetch. `next == None` means the shard is closed (end of life
/// after a split or merge) and no further fetches are possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub records: Vec<Record>,
    pub next: Option<ContinuationToken>,
}

impl Batch {
    pub fn new(records: Vec<Record>, next: Option<ContinuationToken>) -> Self {
        Self { records, next }
    }

    /// Batch carrying no records.
    pub fn empty(next: Option<ContinuationToken>) -> Self {
        Self {
            records: Vec::new(),
            next,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True when the upstream has closed this shard.
    pub fn is_final(&self) -> bool {
        self.next.is_none()
    }
}
