//! Transfer strategy selection and chunk planning

use super::models::Chunk;

/// How a job's bytes are fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One request for the whole entity
    Single,
    /// Parallel byte-range requests, one per chunk
    Chunked { connections: usize },
}

/// Forced strategy for hosts whose name contains `pattern`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRule {
    pub pattern: String,
    pub strategy: Strategy,
}

/// Host overrides consulted before the size/range heuristic
#[derive(Debug, Clone, Default)]
pub struct StrategyPolicy {
    rules: Vec<HostRule>,
}

impl StrategyPolicy {
    pub fn new(rules: Vec<HostRule>) -> Self {
        Self { rules }
    }

    /// Policy forcing single-stream for every given host pattern
    pub fn single_stream_for<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rules = patterns
            .into_iter()
            .map(|pattern| HostRule {
                pattern: pattern.into().to_lowercase(),
                strategy: Strategy::Single,
            })
            .collect();
        Self::new(rules)
    }

    /// First rule whose pattern occurs in `host`
    pub fn forced_for(&self, host: &str) -> Option<Strategy> {
        let host = host.to_lowercase();
        self.rules
            .iter()
            .find(|rule| host.contains(&rule.pattern))
            .map(|rule| rule.strategy)
    }

    pub fn choose(
        &self,
        host: &str,
        filesize: u64,
        supports_ranges: bool,
        min_chunked_size: u64,
        max_connections: usize,
    ) -> Strategy {
        if let Some(forced) = self.forced_for(host) {
            tracing::debug!(host = %host, strategy = ?forced, "Host rule forces strategy");
            return forced;
        }

        if filesize > min_chunked_size && supports_ranges && max_connections > 1 {
            Strategy::Chunked {
                connections: max_connections,
            }
        } else {
            Strategy::Single
        }
    }
}

/// Split `[0, filesize)` into `connections` contiguous inclusive ranges.
///
/// The last chunk absorbs the remainder of the integer division. The count is
/// clamped so no chunk is empty; a zero-byte file yields no chunks.
pub fn plan_chunks(filesize: u64, connections: usize) -> Vec<Chunk> {
    if filesize == 0 {
        return Vec::new();
    }
    let n = (connections.max(1) as u64).min(filesize);
    let chunk_size = filesize / n;

    (0..n)
        .map(|i| {
            let start = i * chunk_size;
            let end = if i == n - 1 {
                filesize - 1
            } else {
                (i + 1) * chunk_size - 1
            };
            Chunk::new(i as usize, start, end)
        })
        .collect()
}

/// `Range` header value for an inclusive span, or an open-ended one
pub fn range_header(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={}-{}", start, end),
        None => format!("bytes={}-", start),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::Strategy;
    use proptest::prelude::*;

    #[test]
    fn test_plan_ten_million_four_ways() {
        let chunks = plan_chunks(10_000_000, 4);
        let ranges: Vec<(u64, u64)> = chunks.iter().map(|c| (c.start_byte, c.end_byte)).collect();
        assert_eq!(
            ranges,
            vec![
                (0, 2_499_999),
                (2_500_000, 4_999_999),
                (5_000_000, 7_499_999),
                (7_500_000, 9_999_999)
            ]
        );
    }

    #[test]
    fn test_last_chunk_absorbs_remainder() {
        let chunks = plan_chunks(10, 3);
        let ranges: Vec<(u64, u64)> = chunks.iter().map(|c| (c.start_byte, c.end_byte)).collect();
        assert_eq!(ranges, vec![(0, 2), (3, 5), (6, 9)]);
    }

    #[test]
    fn test_tiny_and_empty_files() {
        assert!(plan_chunks(0, 8).is_empty());
        let chunks = plan_chunks(3, 8);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 1));
    }

    #[test]
    fn test_host_rule_forces_single_stream() {
        let policy = StrategyPolicy::single_stream_for(["googleusercontent.com"]);
        let strategy = policy.choose(
            "doc-0s-9k-docs.GoogleUserContent.com",
            1 << 30,
            true,
            4 << 20,
            8,
        );
        assert_eq!(strategy, Strategy::Single);
    }

    #[test]
    fn test_heuristic() {
        let policy = StrategyPolicy::default();
        assert_eq!(
            policy.choose("example.com", 10_000_000, true, 4 << 20, 4),
            Strategy::Chunked { connections: 4 }
        );
        // no range support
        assert_eq!(
            policy.choose("example.com", 10_000_000, false, 4 << 20, 4),
            Strategy::Single
        );
        // too small
        assert_eq!(
            policy.choose("example.com", 4 << 20, true, 4 << 20, 4),
            Strategy::Single
        );
        assert_eq!(
            policy.choose("example.com", 10_000_000, true, 4 << 20, 1),
            Strategy::Single
        );
    }

    #[test]
    fn test_custom_rule_table() {
        let policy = StrategyPolicy::new(vec![HostRule {
            pattern: "mirror.test".into(),
            strategy: Strategy::Chunked { connections: 2 },
        }]);
        assert_eq!(
            policy.choose("eu.mirror.test", 10, false, 4 << 20, 8),
            Strategy::Chunked { connections: 2 }
        );
    }

    #[test]
    fn test_range_header() {
        assert_eq!(range_header(0, Some(0)), "bytes=0-0");
        assert_eq!(range_header(512, None), "bytes=512-");
    }

    proptest! {
        #[test]
        fn test_chunks_cover_file_exactly(
            filesize in 1u64..50_000_000_000,
            connections in 1usize..64
        ) {
            let chunks = plan_chunks(filesize, connections);
            prop_assert!(!chunks.is_empty());
            prop_assert_eq!(chunks[0].start_byte, 0);
            prop_assert_eq!(chunks.last().unwrap().end_byte, filesize - 1);

            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[0].end_byte + 1, pair[1].start_byte);
            }
            for chunk in &chunks {
                prop_assert!(chunk.start_byte <= chunk.end_byte);
            }
            let covered: u64 = chunks.iter().map(|c| c.len()).sum();
            prop_assert_eq!(covered, filesize);
        }
    }
}
