//! Heap and thread-stack metrics reported by the DUT.

use serde::{Deserialize, Serialize};

/// Stack usage of one thread, from `__thread_info;"entry-arg",max,size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStackInfo {
    pub entry: String,
    pub arg: Option<String>,
    pub max_stack: u64,
    pub stack_size: u64,
}

impl ThreadStackInfo {
    /// Parse the value part of a `__thread_info` message.
    pub fn parse(value: &str) -> Option<Self> {
        let (quoted, rest) = value.split_once(',')?;
        let entry_arg = quoted.trim().strip_prefix('"')?.strip_suffix('"')?;
        if entry_arg.is_empty()
            || !entry_arg
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == '-' || c == 'x' || c == 'X')
        {
            return None;
        }
        let (max_stack, stack_size) = rest.split_once(',')?;
        let mut parts = entry_arg.split('-');
        let entry = parts.next()?.to_string();
        let arg = parts.next().map(str::to_string);
        Some(Self {
            entry,
            arg,
            max_stack: max_stack.trim().parse().ok()?,
            stack_size: stack_size.trim().parse().ok()?,
        })
    }

    fn key(&self) -> String {
        match &self.arg {
            Some(arg) => format!("{}-{}", self.entry, arg),
            None => self.entry.clone(),
        }
    }
}

/// Aggregate over all reported threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSummary {
    /// Largest stack size of any thread.
    pub max_stack_size: u64,
    /// Peak usage of the thread owning that largest stack.
    pub max_stack_usage: u64,
    pub max_stack_usage_total: u64,
    pub reserved_stack_total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub max_heap: Option<u64>,
    pub reserved_heap: Option<u64>,
    pub thread_stack_info: Vec<ThreadStackInfo>,
    pub stack_summary: Option<StackSummary>,
}

impl MemoryMetrics {
    pub fn is_empty(&self) -> bool {
        self.max_heap.is_none() && self.reserved_heap.is_none() && self.thread_stack_info.is_empty()
    }

    /// Record a thread, replacing an earlier report for the same entry-arg.
    pub fn add_thread(&mut self, info: ThreadStackInfo) {
        let key = info.key();
        match self.thread_stack_info.iter_mut().find(|t| t.key() == key) {
            Some(existing) => *existing = info,
            None => self.thread_stack_info.push(info),
        }
    }

    /// Compute [`StackSummary`] from the collected threads.
    pub fn summarize(&mut self) {
        let mut max: Option<&ThreadStackInfo> = None;
        let mut usage_total: u64 = 0;
        let mut reserved_total: u64 = 0;
        for t in &self.thread_stack_info {
            if max.is_none_or(|m| t.stack_size > m.stack_size) {
                max = Some(t);
            }
            usage_total = usage_total.saturating_add(t.max_stack);
            reserved_total = reserved_total.saturating_add(t.stack_size);
        }
        self.stack_summary = max.map(|m| StackSummary {
            max_stack_size: m.stack_size,
            max_stack_usage: m.max_stack,
            max_stack_usage_total: usage_total,
            reserved_stack_total: reserved_total,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_thread_info() {
        let t = ThreadStackInfo::parse("\"0x1234-0x0\",312,1024").unwrap();
        assert_eq!(t.entry, "0x1234");
        assert_eq!(t.arg.as_deref(), Some("0x0"));
        assert_eq!((t.max_stack, t.stack_size), (312, 1024));

        let t = ThreadStackInfo::parse("\"abcd\",1,2").unwrap();
        assert_eq!(t.arg, None);

        assert!(ThreadStackInfo::parse("abcd,1,2").is_none());
        assert!(ThreadStackInfo::parse("\"zz\",1,2").is_none());
    }

    #[test]
    fn test_summary_and_dedup() {
        let mut m = MemoryMetrics::default();
        m.add_thread(ThreadStackInfo::parse("\"a-1\",100,512").unwrap());
        m.add_thread(ThreadStackInfo::parse("\"b-1\",300,2048").unwrap());
        m.add_thread(ThreadStackInfo::parse("\"a-1\",200,512").unwrap());
        m.summarize();
        assert_eq!(m.thread_stack_info.len(), 2);
        assert_eq!(
            m.stack_summary,
            Some(StackSummary {
                max_stack_size: 2048,
                max_stack_usage: 300,
                max_stack_usage_total: 500,
                reserved_stack_total: 2560,
            })
        );
    }

    #[test]
    fn test_summary_saturates_on_huge_values() {
        let mut m = MemoryMetrics::default();
        let huge = u64::MAX.to_string();
        m.add_thread(ThreadStackInfo::parse(&format!("\"a-1\",{huge},{huge}")).unwrap());
        m.add_thread(ThreadStackInfo::parse(&format!("\"b-1\",{huge},{huge}")).unwrap());
        m.summarize();
        let summary = m.stack_summary.unwrap();
        assert_eq!(summary.max_stack_usage_total, u64::MAX);
        assert_eq!(summary.reserved_stack_total, u64::MAX);
    }
}
