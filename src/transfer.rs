//! Collaborator seams for record transfer.
//!
//! The bridge never inspects encoded buffers — it only learns byte lengths
//! and remainder flags. Serialization lives behind [`RecordSender`] and
//! [`RecordReceiver`], which spool encoded units through the scratch files
//! announced in the handshake preamble.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use crate::bridge::protocol::InputSlot;

/// Scalar units the bridge itself injects into the stream during broadcast
/// distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaRecord<'a> {
    /// Number of broadcast variables that follow.
    Count(usize),
    /// Name of the next broadcast collection.
    Name(&'a str),
}

/// Encodes records into the input scratch buffer for transfer to the worker.
pub trait RecordSender {
    type Record;

    fn open(&mut self, path: &Path) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;

    /// Encode one standalone scalar unit, returning its encoded byte length.
    fn send_record(&mut self, value: &MetaRecord<'_>) -> io::Result<usize>;

    /// Encode as many records as fit into one buffer unit for `slot`,
    /// returning the encoded byte length. A record that did not fit whole
    /// is tracked as remainder for that slot.
    fn send_buffer(
        &mut self,
        records: &mut dyn Iterator<Item = Self::Record>,
        slot: InputSlot,
    ) -> io::Result<usize>;

    /// Whether a partially flushed unit is still pending for `slot`.
    fn has_remaining(&self, slot: InputSlot) -> bool;

    /// Clear remainder state between logical units.
    fn reset(&mut self);
}

/// Decodes result buffers from the output scratch file into a collector.
pub trait RecordReceiver {
    type Record;

    fn open(&mut self, path: &Path) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;

    /// Decode one result unit of the given size/class marker into `out`.
    fn collect_buffer(
        &mut self,
        out: &mut dyn Collector<Self::Record>,
        size: i32,
    ) -> io::Result<()>;
}

/// Sink for decoded result records.
pub trait Collector<T> {
    fn collect(&mut self, record: T);
}

impl<T> Collector<T> for Vec<T> {
    fn collect(&mut self, record: T) {
        self.push(record);
    }
}

/// Resolves the named broadcast collections of the owning task.
pub trait BroadcastSource {
    type Record;

    /// Iterator over the named collection, or `None` if it is not
    /// registered with the task.
    fn variable(&mut self, name: &str) -> Option<Box<dyn Iterator<Item = Self::Record> + '_>>;
}

impl<T: Clone> BroadcastSource for HashMap<String, Vec<T>> {
    type Record = T;

    fn variable(&mut self, name: &str) -> Option<Box<dyn Iterator<Item = T> + '_>> {
        self.get(name)
            .map(|records| Box::new(records.iter().cloned()) as Box<dyn Iterator<Item = T> + '_>)
    }
}
