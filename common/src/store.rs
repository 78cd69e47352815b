use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};

use crate::{error::StorageError, interval::ReportingInterval};

pub const INTERVAL_RECORD: &str = "interval_ms";
const RECORD_LEN: usize = core::mem::size_of::<u32>();

pub trait RecordStorage {
    /// Returns the number of bytes copied into `buf`; a missing record reads
    /// as zero bytes.
    fn read_record(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    fn write_record(&mut self, name: &str, data: &[u8]) -> Result<usize, StorageError>;
}

pub struct IntervalStore<R> {
    storage: Arc<Mutex<R>>,
}

impl<R> Clone for IntervalStore<R> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<R: RecordStorage> IntervalStore<R> {
    pub fn new(storage: R) -> Self {
        Self {
            storage: Arc::new(Mutex::new(storage)),
        }
    }

    pub fn save(&self, interval: ReportingInterval) -> Result<(), StorageError> {
        let mut storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        let written =
            storage.write_record(INTERVAL_RECORD, &interval.as_millis().to_le_bytes())?;
        if written != RECORD_LEN {
            return Err(StorageError::Backend(format!(
                "short write: {written} of {RECORD_LEN} bytes"
            )));
        }
        info!("interval persisted: {interval}");
        Ok(())
    }

    pub fn load(&self) -> Result<Option<ReportingInterval>, StorageError> {
        let mut storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        let mut buf = [0_u8; RECORD_LEN];
        let read = storage.read_record(INTERVAL_RECORD, &mut buf)?;
        if read < RECORD_LEN {
            debug!("interval record short ({read} of {RECORD_LEN} bytes)");
            return Ok(None);
        }

        let raw = u32::from_le_bytes(buf);
        let interval = ReportingInterval::from_millis(raw);
        if interval.is_none() {
            warn!("stored interval {raw} ms is out of range; ignoring it");
        }
        Ok(interval)
    }
}
