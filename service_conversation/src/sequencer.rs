//! 单方向消息的去重与按序交付。
//!
//! 每个会话的每个方向各持有一个 `Sequencer`，`next_expected` 从 0 开始：
//! - 序号等于 `next_expected`：交付，并继续交付缓冲区中紧随其后的连续消息；
//! - 序号小于 `next_expected` 或已在缓冲区：重复，静默丢弃；
//! - 序号大于 `next_expected`：缓冲直到空缺补齐；缓冲区满时丢弃并记录协议违规。
//!
//! 终止哨兵不经过本模块。

use std::collections::BTreeMap;

use log::warn;

/// 缓冲区默认容量。
pub const DEFAULT_MAX_BUFFERED: usize = 64;

/// 单条消息的接收判定结果。
#[derive(Debug, PartialEq)]
pub enum SequenceDecision<T> {
    /// 按序可交付的消息（可能包含之前被缓冲的后续消息）。
    Deliver(Vec<T>),
    /// 已交付过或已在缓冲区中。
    Duplicate,
    /// 序号超前，已缓冲，等待 `expected` 到达。
    Buffered { expected: u64 },
    /// 序号超前且缓冲区已满，已丢弃。
    Rejected { expected: u64, received: u64 },
}

#[derive(Debug)]
pub struct Sequencer<T> {
    next_expected: u64,
    buffered: BTreeMap<u64, T>,
    max_buffered: usize,
}

impl<T> Default for Sequencer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERED)
    }
}

impl<T> Sequencer<T> {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            next_expected: 0,
            buffered: BTreeMap::new(),
            max_buffered,
        }
    }

    /// 下一个期望的序号。
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// 当前缓冲的超前消息数。
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// 对序号为 `index` 的消息做接收判定。
    pub fn accept(&mut self, index: u64, item: T) -> SequenceDecision<T> {
        if index < self.next_expected || self.buffered.contains_key(&index) {
            return SequenceDecision::Duplicate;
        }

        if index > self.next_expected {
            if self.buffered.len() >= self.max_buffered {
                warn!(
                    "[排序器] 序号 {} 超前于期望序号 {}，且缓冲区已满 ({} 条)，丢弃该消息。",
                    index, self.next_expected, self.max_buffered
                );
                return SequenceDecision::Rejected {
                    expected: self.next_expected,
                    received: index,
                };
            }
            self.buffered.insert(index, item);
            return SequenceDecision::Buffered {
                expected: self.next_expected,
            };
        }

        let mut ready = vec![item];
        self.next_expected += 1;
        while let Some(next) = self.buffered.remove(&self.next_expected) {
            ready.push(next);
            self.next_expected += 1;
        }
        SequenceDecision::Deliver(ready)
    }
}
