//! Per-variable record queues.

use {
    crate::packer::PackerCore,
    fegem_wire::{
        bank_format::{
            host_byte_order, pad_fixed, BankHeader, BANK_HEADER_LEN, CATEGORY_LEN, DESCRIPTION_LEN,
            VARNAME_LEN,
        },
        DataType, LvTimestamp, LV_TIMESTAMP_LEN,
    },
    log::*,
    std::{collections::VecDeque, sync::Mutex},
};

/// In-memory queue for one (category, varname) variable, serialised as one
/// LVBANK per flush. Identity and header fields are fixed at creation; only
/// the record queue mutates.
pub struct DataBank {
    data_type: DataType,
    category: [u8; CATEGORY_LEN],
    varname: [u8; VARNAME_LEN],
    description: [u8; DESCRIPTION_LEN],
    history_settings: i16,
    history_rate: i16,
    records: Mutex<RecordQueue>,
}

#[derive(Default)]
struct RecordQueue {
    /// LVDATA width established by the first append, zero until then.
    record_len: usize,
    queue: VecDeque<Vec<u8>>,
}

impl DataBank {
    pub fn new(
        data_type: DataType,
        category: &str,
        varname: &str,
        description: &str,
        history_settings: i16,
        history_rate: i16,
    ) -> Self {
        Self {
            data_type,
            category: pad_fixed(category),
            varname: pad_fixed(varname),
            description: pad_fixed(description),
            history_settings,
            history_rate,
            records: Mutex::new(RecordQueue::default()),
        }
    }

    pub(crate) fn matches(&self, category: &[u8; CATEGORY_LEN], varname: &[u8; VARNAME_LEN]) -> bool {
        self.category == *category && self.varname == *varname
    }

    /// Queue one timestamped record. Every record of a bank must have the
    /// width established by its first append; a mismatch is a programming
    /// error in the producer.
    pub fn append(&self, timestamp: LvTimestamp, data: &[u8]) {
        let mut record = Vec::with_capacity(LV_TIMESTAMP_LEN + data.len());
        record.extend_from_slice(&timestamp.to_le_bytes());
        record.extend_from_slice(data);

        let mut records = self.records.lock().unwrap();
        if records.record_len == 0 {
            records.record_len = record.len();
        }
        assert_eq!(
            records.record_len,
            record.len(),
            "LVDATA width changed for {}/{}",
            String::from_utf8_lossy(&self.category),
            String::from_utf8_lossy(&self.varname),
        );
        records.queue.push_back(record);
    }

    /// Number of queued records.
    pub fn pending(&self) -> usize {
        self.records.lock().unwrap().queue.len()
    }

    /// Drain queued records into a framed LVBANK bounded by `budget` bytes.
    ///
    /// Records are packed in append order. Whatever does not fit goes back
    /// to the head of the queue for the next pass, and `owner`'s overflow
    /// counter rises. Returns an empty buffer when nothing fits.
    pub(crate) fn flush(&self, owner: &PackerCore, budget: usize) -> Vec<u8> {
        let (mut local, block_size) = {
            let mut records = self.records.lock().unwrap();
            if records.queue.is_empty() {
                return Vec::new();
            }
            let queue = std::mem::take(&mut records.queue);
            (queue, records.record_len)
        };

        // The queue is drained; pack outside the lock.
        let mut remaining = budget.saturating_sub(BANK_HEADER_LEN);
        let mut payload = Vec::new();
        let mut num_blocks = 0_i32;
        while remaining >= block_size {
            let Some(record) = local.pop_front() else {
                break;
            };
            payload.extend_from_slice(&record);
            remaining -= block_size;
            num_blocks += 1;
        }

        if !local.is_empty() {
            debug!(
                "overflow prevented on {}/{}: {} records requeued",
                String::from_utf8_lossy(&self.category),
                String::from_utf8_lossy(&self.varname),
                local.len(),
            );
            let mut records = self.records.lock().unwrap();
            while let Some(record) = local.pop_back() {
                records.queue.push_front(record);
            }
            drop(records);
            owner.note_buffer_overflow();
        }

        if num_blocks == 0 {
            return Vec::new();
        }

        let header = BankHeader {
            data_type: self.data_type,
            category: self.category,
            varname: self.varname,
            description: self.description,
            history_settings: self.history_settings,
            history_rate: self.history_rate,
            timestamp_byte_order: host_byte_order(),
            data_byte_order: host_byte_order(),
            block_size: block_size as i32,
            num_blocks,
        };
        let mut bank = Vec::with_capacity(BANK_HEADER_LEN + payload.len());
        header.encode_into(&mut bank);
        bank.extend_from_slice(&payload);
        bank
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        fegem_wire::ParsedBank,
    };

    fn test_core() -> PackerCore {
        PackerCore::new("localhost", 5555)
    }

    fn double_bank() -> DataBank {
        DataBank::new(DataType::Double, "Cat", "Var", "desc", 0, 1)
    }

    fn ts(unix_seconds: i64) -> LvTimestamp {
        LvTimestamp::from_unix_parts(unix_seconds, 0)
    }

    #[test]
    fn test_append_and_pending() {
        let bank = double_bank();
        assert_eq!(bank.pending(), 0);
        bank.append(ts(0), &1.0_f64.to_le_bytes());
        bank.append(ts(1), &2.0_f64.to_le_bytes());
        assert_eq!(bank.pending(), 2);
    }

    #[test]
    #[should_panic(expected = "LVDATA width changed")]
    fn test_append_rejects_width_change() {
        let bank = double_bank();
        bank.append(ts(0), &1.0_f64.to_le_bytes());
        bank.append(ts(1), &[0_u8; 16]);
    }

    #[test]
    fn test_flush_emits_framed_bank() {
        let core = test_core();
        let bank = double_bank();
        bank.append(ts(0), &1.0_f64.to_le_bytes());
        bank.append(ts(1), &2.0_f64.to_le_bytes());

        let bytes = bank.flush(&core, 10_000);
        // two 24-byte blocks behind the 88-byte header
        assert_eq!(bytes.len(), BANK_HEADER_LEN + 2 * 24);
        let parsed = ParsedBank::parse(&bytes).unwrap();
        assert_eq!(parsed.header.data_type, DataType::Double);
        assert_eq!(parsed.header.block_size, 24);
        assert_eq!(parsed.header.num_blocks, 2);
        assert_eq!(parsed.header.timestamp_byte_order, host_byte_order());

        let blocks: Vec<_> = parsed.blocks().collect();
        assert_eq!(blocks[0].1, &1.0_f64.to_le_bytes());
        assert_eq!(blocks[1].1, &2.0_f64.to_le_bytes());
        assert_eq!(blocks[0].0, ts(0));

        assert_eq!(bank.pending(), 0);
        assert_eq!(core.buffer_overflow_count(), 0);
    }

    #[test]
    fn test_partial_flush_requeues_in_order() {
        let core = test_core();
        let bank = double_bank();
        for i in 0..3 {
            bank.append(ts(i), &(i as f64).to_le_bytes());
        }

        // room for the header plus exactly two 24-byte blocks
        let bytes = bank.flush(&core, BANK_HEADER_LEN + 2 * 24);
        let parsed = ParsedBank::parse(&bytes).unwrap();
        assert_eq!(parsed.header.num_blocks, 2);
        assert_eq!(bank.pending(), 1);
        assert_eq!(core.buffer_overflow_count(), 1);

        // the leftover record is still first in line
        let bytes = bank.flush(&core, 10_000);
        let parsed = ParsedBank::parse(&bytes).unwrap();
        let blocks: Vec<_> = parsed.blocks().collect();
        assert_eq!(blocks[0].1, &2.0_f64.to_le_bytes());
    }

    #[test]
    fn test_record_wider_than_budget_flushes_empty() {
        let core = test_core();
        let bank = double_bank();
        bank.append(ts(0), &1.0_f64.to_le_bytes());

        let bytes = bank.flush(&core, BANK_HEADER_LEN + 8);
        assert!(bytes.is_empty());
        assert_eq!(bank.pending(), 1);
        assert_eq!(core.buffer_overflow_count(), 1);
    }

    #[test]
    fn test_flush_of_empty_bank_is_empty() {
        let core = test_core();
        let bank = double_bank();
        assert!(bank.flush(&core, 10_000).is_empty());
        assert_eq!(core.buffer_overflow_count(), 0);
    }
}
