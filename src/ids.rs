use std::fmt::{Display, Formatter};
use std::sync::Mutex;
use tracing::error;

/// Identifies a publisher or subscriber endpoint. Ids are handed out by the discovery layer, the
///  transport treats them as opaque.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RepoId(u64);

impl Display for RepoId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RepoId {
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

/// The publication a sample belongs to, i.e. the publishing side's `RepoId` as it appears on the
///  wire in a sample header.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PublicationId(u64);

impl Display for PublicationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PublicationId {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

impl From<RepoId> for PublicationId {
    fn from(value: RepoId) -> Self {
        PublicationId(value.0)
    }
}

impl From<PublicationId> for RepoId {
    fn from(value: PublicationId) -> Self {
        RepoId(value.0)
    }
}

/// Identity of a single sample as far as the send path is concerned, used for 'unsending' it
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SampleKey {
    pub publication_id: PublicationId,
    pub sequence: u32,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct DataLinkId(u64);

impl Display for DataLinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

impl DataLinkId {
    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

/// Hands out process-unique link ids. Ids are never reused: once the counter is exhausted, no more
///  ids are handed out, and this is reported as a corruption of the id space.
pub struct DataLinkIdGenerator {
    next: Mutex<Option<u64>>,
}

impl Default for DataLinkIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLinkIdGenerator {
    pub fn new() -> DataLinkIdGenerator {
        Self::starting_at(0)
    }

    fn starting_at(first: u64) -> DataLinkIdGenerator {
        DataLinkIdGenerator {
            next: Mutex::new(Some(first)),
        }
    }

    pub fn next_id(&self) -> Option<DataLinkId> {
        let mut next = self.next.lock().unwrap();
        match *next {
            Some(id) => {
                *next = id.checked_add(1);
                if next.is_none() {
                    error!("data link id space exhausted after id {} - no further links can be created", id);
                }
                Some(DataLinkId(id))
            }
            None => {
                error!("data link id counter rolled over - refusing to reuse ids, this indicates a corrupted id space");
                None
            }
        }
    }
}
