//! Per-chip transaction queues, one per scheduler category.

use fsim_types::{TransactionCategory, TxHandle};
use std::collections::VecDeque;

/// The seven dispatch queues of one (channel, chip) pair.
#[derive(Debug, Default)]
pub struct ChipQueues {
    pub user_read: VecDeque<TxHandle>,
    pub user_write: VecDeque<TxHandle>,
    pub mapping_read: VecDeque<TxHandle>,
    pub mapping_write: VecDeque<TxHandle>,
    pub gc_read: VecDeque<TxHandle>,
    pub gc_write: VecDeque<TxHandle>,
    pub gc_erase: VecDeque<TxHandle>,
}

impl ChipQueues {
    #[must_use]
    pub fn queue(&self, category: TransactionCategory) -> &VecDeque<TxHandle> {
        match category {
            TransactionCategory::UserRead => &self.user_read,
            TransactionCategory::UserWrite => &self.user_write,
            TransactionCategory::MappingRead => &self.mapping_read,
            TransactionCategory::MappingWrite => &self.mapping_write,
            TransactionCategory::GcRead => &self.gc_read,
            TransactionCategory::GcWrite => &self.gc_write,
            TransactionCategory::GcErase => &self.gc_erase,
        }
    }

    pub fn queue_mut(&mut self, category: TransactionCategory) -> &mut VecDeque<TxHandle> {
        match category {
            TransactionCategory::UserRead => &mut self.user_read,
            TransactionCategory::UserWrite => &mut self.user_write,
            TransactionCategory::MappingRead => &mut self.mapping_read,
            TransactionCategory::MappingWrite => &mut self.mapping_write,
            TransactionCategory::GcRead => &mut self.gc_read,
            TransactionCategory::GcWrite => &mut self.gc_write,
            TransactionCategory::GcErase => &mut self.gc_erase,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.user_read.len()
            + self.user_write.len()
            + self.mapping_read.len()
            + self.mapping_write.len()
            + self.gc_read.len()
            + self.gc_write.len()
            + self.gc_erase.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
