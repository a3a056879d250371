use crate::server::connection::ConnectionRecord;
use std::{collections::TryReserveError, sync::Arc};

/// Every connection accepted so far, in acceptance order.
///
/// Only the accept thread touches the collection itself. Workers reach their
/// own record through an `Arc` and only ever clear its `open` flag.
#[derive(Default)]
pub(crate) struct Registry {
    records: Vec<Arc<ConnectionRecord>>,
}

impl Registry {
    #[inline]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends `record`, failing only if the collection cannot grow.
    #[inline]
    pub(crate) fn add(&mut self, record: Arc<ConnectionRecord>) -> Result<(), TryReserveError> {
        self.records.try_reserve(1)?;
        self.records.push(record);
        Ok(())
    }

    /// Visits every record once, in insertion order.
    #[inline]
    pub(crate) fn for_each(&self, mut visitor: impl FnMut(&ConnectionRecord)) {
        self.records.iter().for_each(|record| visitor(record));
    }

    /// Keeps the records for which `keep` holds, preserving their order, and
    /// returns how many were removed.
    pub(crate) fn flush(&mut self, mut keep: impl FnMut(&ConnectionRecord) -> bool) -> usize {
        let before = self.records.len();
        self.records.retain(|record| keep(record));
        before - self.records.len()
    }

    /// `true` once no record is open. Polled by the shutdown barrier.
    #[inline]
    pub(crate) fn all_closed(&self) -> bool {
        self.records.iter().all(|record| !record.is_open())
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}
