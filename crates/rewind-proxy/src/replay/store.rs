//! Mock pool and the match engine
//!
//! Matching runs a cascade of increasingly fuzzy tiers and stops at the
//! first tier that yields a candidate:
//!
//! 1. exact match of a single request (decoded bytes or base64 text)
//! 2. exact match of a whole request sequence, position by position
//! 3. smallest edit distance, for printable text requests
//! 4. highest Jaccard similarity of adaptive k-shingles
//!
//! The chosen mock is removed from the pool before the lock is released, so
//! each recorded response is served at most once.

use std::fmt;

use rewind_core::{GenericPayload, Mock, MockSpec, ShingleSettings};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::normalize::normalize_auth_for_replay;
use super::similarity::{
    adaptive_k, create_shingles, is_ascii_printable, jaccard_similarity, levenshtein,
};
use crate::protocol::postgres::{decode_payload, encode_payload};

/// Which tier selected a mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    Exact,
    ExactSequence,
    Levenshtein,
    Jaccard,
}

impl fmt::Display for MatchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchTier::Exact => write!(f, "exact"),
            MatchTier::ExactSequence => write!(f, "exact-sequence"),
            MatchTier::Levenshtein => write!(f, "levenshtein"),
            MatchTier::Jaccard => write!(f, "jaccard"),
        }
    }
}

/// Recorded reply chosen by [`MockStore::match_request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Base64 response of a Postgres mock
    Single(String),
    /// Responses of a generic mock
    Sequence(Vec<GenericPayload>),
}

/// Ordered pool of mocks consumed by replay
pub struct MockStore {
    mocks: Mutex<Vec<Mock>>,
    shingles: ShingleSettings,
}

impl MockStore {
    pub fn new(shingles: ShingleSettings) -> Self {
        Self::with_mocks(Vec::new(), shingles)
    }

    pub fn with_mocks(mocks: Vec<Mock>, shingles: ShingleSettings) -> Self {
        Self {
            mocks: Mutex::new(mocks),
            shingles,
        }
    }

    /// Replace the whole pool
    pub async fn set_mocks(&self, mocks: Vec<Mock>) {
        *self.mocks.lock().await = mocks;
    }

    /// Snapshot of the pool
    pub async fn mocks(&self) -> Vec<Mock> {
        self.mocks.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.mocks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.mocks.lock().await.is_empty()
    }

    /// Rewrite authentication exchanges across the pool for replay
    pub async fn prepare_for_replay(&self) -> usize {
        let mut mocks = self.mocks.lock().await;
        let rewritten = normalize_auth_for_replay(&mut mocks);
        info!(mocks = mocks.len(), rewritten, "Prepared mock pool for replay");
        rewritten
    }

    /// Find, consume and return the recorded response for one request
    ///
    /// Only single-message Postgres mocks are candidates. Returns `None`
    /// only when there is no candidate at all.
    pub async fn match_single(&self, buf: &[u8]) -> Option<String> {
        let mut mocks = self.mocks.lock().await;
        let (idx, tier) = self.find_one(&mocks, buf, false)?;

        let mock = mocks.remove(idx);
        debug!(mock = %mock.name, tier = %tier, remaining = mocks.len(), "Matched request");
        match mock.spec {
            MockSpec::Postgres { response, .. } => Some(response),
            _ => None,
        }
    }

    /// Find, consume and return the reply to one request from any mock
    /// recorded with exactly one request
    ///
    /// Postgres mocks and one-step generic mocks compete in pool order, so an
    /// exact hit of either kind wins over every fuzzy candidate.
    pub async fn match_request(&self, buf: &[u8]) -> Option<Reply> {
        let mut mocks = self.mocks.lock().await;
        let (idx, tier) = self.find_one(&mocks, buf, true)?;

        let mock = mocks.remove(idx);
        debug!(mock = %mock.name, tier = %tier, remaining = mocks.len(), "Matched request");
        match mock.spec {
            MockSpec::Postgres { response, .. } => Some(Reply::Single(response)),
            MockSpec::Generic { responses, .. } => Some(Reply::Sequence(responses)),
            MockSpec::Http { .. } => None,
        }
    }

    /// Find, consume and return the recorded responses for a request sequence
    ///
    /// Only generic mocks with exactly `bufs.len()` requests are candidates.
    pub async fn match_sequence<B: AsRef<[u8]>>(&self, bufs: &[B]) -> Option<Vec<GenericPayload>> {
        let mut mocks = self.mocks.lock().await;

        let candidates: Vec<(usize, Vec<Option<&str>>)> = mocks
            .iter()
            .enumerate()
            .filter_map(|(idx, mock)| match &mock.spec {
                MockSpec::Generic { requests, .. } if requests.len() == bufs.len() => Some((
                    idx,
                    requests.iter().map(GenericPayload::first_data).collect(),
                )),
                _ => None,
            })
            .collect();

        let (idx, tier) = self.select_sequence(bufs, &candidates)?;
        drop(candidates);

        let mock = mocks.remove(idx);
        debug!(mock = %mock.name, tier = %tier, remaining = mocks.len(), "Matched request sequence");
        match mock.spec {
            MockSpec::Generic { responses, .. } => Some(responses),
            _ => None,
        }
    }

    /// Run the single-request cascade over the pool
    ///
    /// One-step generic mocks are candidates only with `include_generic`.
    fn find_one(
        &self,
        mocks: &[Mock],
        buf: &[u8],
        include_generic: bool,
    ) -> Option<(usize, MatchTier)> {
        let candidates: Vec<(usize, Vec<u8>, &str)> = mocks
            .iter()
            .enumerate()
            .filter_map(|(idx, mock)| {
                let request = match &mock.spec {
                    MockSpec::Postgres { request, .. } => request.as_str(),
                    MockSpec::Generic { requests, .. } if include_generic && requests.len() == 1 => {
                        requests[0].first_data()?
                    }
                    _ => return None,
                };
                Some((idx, decode_payload(request).unwrap_or_default(), request))
            })
            .collect();

        self.select_single(buf, &candidates)
    }

    /// Pick a pool index among `(pool index, decoded request, encoded request)`
    fn select_single(
        &self,
        buf: &[u8],
        candidates: &[(usize, Vec<u8>, &str)],
    ) -> Option<(usize, MatchTier)> {
        let encoded = encode_payload(buf);

        if let Some((idx, _, _)) = candidates
            .iter()
            .find(|(_, decoded, request)| decoded.as_slice() == buf || *request == encoded)
        {
            return Some((*idx, MatchTier::Exact));
        }

        if is_ascii_printable(buf) {
            let mut best: Option<(usize, usize)> = None;
            for (idx, decoded, _) in candidates {
                if !is_ascii_printable(decoded) {
                    continue;
                }
                let distance = levenshtein(buf, decoded);
                if distance == 0 {
                    return Some((*idx, MatchTier::Levenshtein));
                }
                if best.map_or(true, |(_, min)| distance < min) {
                    best = Some((*idx, distance));
                }
            }
            if let Some((idx, _)) = best {
                return Some((idx, MatchTier::Levenshtein));
            }
        }

        let k = self.shingle_size(buf.len());
        let input = create_shingles(buf, k);
        let mut best: Option<(usize, f64)> = None;
        for (idx, decoded, _) in candidates {
            let similarity = jaccard_similarity(&create_shingles(decoded, k), &input);
            if best.map_or(true, |(_, max)| similarity > max) {
                best = Some((*idx, similarity));
            }
        }
        best.map(|(idx, _)| (idx, MatchTier::Jaccard))
    }

    /// Pick a pool index among `(pool index, encoded requests)`
    fn select_sequence<B: AsRef<[u8]>>(
        &self,
        bufs: &[B],
        candidates: &[(usize, Vec<Option<&str>>)],
    ) -> Option<(usize, MatchTier)> {
        let encoded: Vec<String> = bufs.iter().map(|b| encode_payload(b.as_ref())).collect();

        let decoded: Vec<Vec<Vec<u8>>> = candidates
            .iter()
            .map(|(_, requests)| {
                requests
                    .iter()
                    .map(|r| r.and_then(|r| decode_payload(r).ok()).unwrap_or_default())
                    .collect()
            })
            .collect();

        for ((idx, requests), decoded) in candidates.iter().zip(&decoded) {
            let all_equal = bufs.iter().enumerate().all(|(pos, buf)| {
                requests[pos].is_some()
                    && (decoded[pos].as_slice() == buf.as_ref()
                        || requests[pos] == Some(encoded[pos].as_str()))
            });
            if all_equal {
                return Some((*idx, MatchTier::ExactSequence));
            }
        }

        let mut best: Option<(usize, f64)> = None;
        for ((idx, _), decoded) in candidates.iter().zip(&decoded) {
            for (buf, recorded) in bufs.iter().zip(decoded) {
                let buf = buf.as_ref();
                let k = self.shingle_size(buf.len());
                let similarity =
                    jaccard_similarity(&create_shingles(recorded, k), &create_shingles(buf, k));
                if best.map_or(true, |(_, max)| similarity > max) {
                    best = Some((*idx, similarity));
                }
            }
        }
        best.map(|(idx, _)| (idx, MatchTier::Jaccard))
    }

    fn shingle_size(&self, length: usize) -> usize {
        adaptive_k(
            length,
            self.shingles.k_min,
            self.shingles.k_max,
            self.shingles.divisor,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::postgres::tests::tagged;
    use rewind_core::Origin;

    fn store(mocks: Vec<Mock>) -> MockStore {
        MockStore::with_mocks(mocks, ShingleSettings::default())
    }

    fn pg(name: &str, request: &[u8], response: &str) -> Mock {
        Mock::postgres(name, encode_payload(request), response.to_string())
    }

    #[tokio::test]
    async fn test_exact_match_consumes_mock() {
        let store = store(vec![
            pg("a", b"\x00\x01binary-a", "QQ=="),
            pg("b", b"\x00\x01binary-b", "Qg=="),
        ]);

        assert_eq!(store.match_single(b"\x00\x01binary-b").await.as_deref(), Some("Qg=="));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.mocks().await[0].name, "a");
    }

    #[tokio::test]
    async fn test_exact_match_takes_first_of_duplicates() {
        let store = store(vec![
            pg("first", b"\x01dup", "MQ=="),
            pg("second", b"\x01dup", "Mg=="),
        ]);

        assert_eq!(store.match_single(b"\x01dup").await.as_deref(), Some("MQ=="));
        assert_eq!(store.match_single(b"\x01dup").await.as_deref(), Some("Mg=="));
        assert_eq!(store.match_single(b"\x01dup").await, None);
    }

    #[tokio::test]
    async fn test_levenshtein_prefers_closest_text() {
        let store = store(vec![
            pg("far", b"DELETE FROM orders", "ZmFy"),
            pg("near", b"SELECT * FROM users WHERE id = 1", "bmVhcg=="),
            pg("binary", b"\x00\x00SELECT", "Ymlu"),
        ]);

        let response = store.match_single(b"SELECT * FROM users WHERE id = 2").await;
        assert_eq!(response.as_deref(), Some("bmVhcg=="));
    }

    #[tokio::test]
    async fn test_levenshtein_ties_take_lowest_index() {
        let store = store(vec![pg("x", b"abcX", "eA=="), pg("y", b"abcY", "eQ==")]);
        assert_eq!(store.match_single(b"abcZ").await.as_deref(), Some("eA=="));
    }

    #[tokio::test]
    async fn test_binary_request_uses_jaccard() {
        let query_a = tagged(b'Q', b"SELECT id, name FROM customers\0");
        let query_b = tagged(b'Q', b"UPDATE inventory SET count = 0\0");
        let store = store(vec![pg("a", &query_a, "YQ=="), pg("b", &query_b, "Yg==")]);

        let live = tagged(b'Q', b"UPDATE inventory SET count = 7\0");
        assert_eq!(store.match_single(&live).await.as_deref(), Some("Yg=="));
    }

    #[tokio::test]
    async fn test_empty_pool_is_a_miss() {
        let store = store(Vec::new());
        assert_eq!(store.match_single(b"anything").await, None);

        // Generic mocks are not single-match candidates
        let store = self::store(vec![Mock::generic(
            "g",
            vec![GenericPayload::single(Origin::Client, "AA==")],
            vec![GenericPayload::single(Origin::Server, "AA==")],
        )]);
        assert_eq!(store.match_single(b"\x00").await, None);
        assert_eq!(store.len().await, 1);
    }

    fn generic(name: &str, requests: &[&[u8]], responses: &[&str]) -> Mock {
        Mock::generic(
            name,
            requests
                .iter()
                .map(|r| GenericPayload::single(Origin::Client, encode_payload(r)))
                .collect(),
            responses
                .iter()
                .map(|r| GenericPayload::single(Origin::Server, *r))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_sequence_exact_requires_every_position() {
        let store = store(vec![
            generic("partial", &[b"one", b"two-x"], &["cA=="]),
            generic("full", &[b"one", b"two"], &["Zg=="]),
        ]);

        let responses = store.match_sequence(&[b"one".to_vec(), b"two".to_vec()]).await.unwrap();
        assert_eq!(responses[0].first_data(), Some("Zg=="));
        assert_eq!(store.mocks().await[0].name, "partial");
    }

    #[tokio::test]
    async fn test_sequence_length_must_agree() {
        let store = store(vec![generic("three", &[b"a", b"b", b"c"], &["YQ=="])]);
        assert_eq!(store.match_sequence(&[b"a".to_vec()]).await, None);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_sequence_falls_back_to_jaccard() {
        let store = store(vec![
            generic("orders", &[b"SELECT * FROM orders WHERE id = 10"], &["b3Jk"]),
            generic("users", &[b"SELECT * FROM users WHERE id = 10"], &["dXNy"]),
        ]);

        let responses = store
            .match_sequence(&[b"SELECT * FROM users WHERE id = 11".to_vec()])
            .await
            .unwrap();
        assert_eq!(responses[0].first_data(), Some("dXNy"));
    }

    #[tokio::test]
    async fn test_zero_similarity_still_returns_first_candidate() {
        // Non-printable input sharing no shingle with any recorded request
        let input = b"\x03\x04\x05\x06\x07";

        let store = store(vec![
            pg("first", b"\x01\x01\x01\x01", "MQ=="),
            pg("second", b"\x02\x02\x02\x02", "Mg=="),
        ]);
        assert_eq!(store.match_single(input).await.as_deref(), Some("MQ=="));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.mocks().await[0].name, "second");

        let store = self::store(vec![
            generic("first", &[b"\x01\x01\x01\x01"], &["MQ=="]),
            generic("second", &[b"\x02\x02\x02\x02"], &["Mg=="]),
        ]);
        let responses = store.match_sequence(&[input]).await.unwrap();
        assert_eq!(responses[0].first_data(), Some("MQ=="));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.mocks().await[0].name, "second");
    }

    #[tokio::test]
    async fn test_match_request_prefers_exact_hit_of_either_kind() {
        let store = store(vec![
            generic("fuzzy", &[b"\x01\x02totally-different"], &["V1JPTkc="]),
            pg("exact", b"ping", "UklHSFQ="),
        ]);

        assert_eq!(
            store.match_request(b"ping").await,
            Some(Reply::Single("UklHSFQ=".to_string()))
        );
        assert_eq!(store.mocks().await[0].name, "fuzzy");

        // Only the generic mock is left, so it becomes the best effort
        match store.match_request(b"ping").await {
            Some(Reply::Sequence(responses)) => {
                assert_eq!(responses[0].first_data(), Some("V1JPTkc="))
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(store.match_request(b"ping").await, None);
    }

    #[tokio::test]
    async fn test_match_request_skips_multi_step_generics() {
        let store = store(vec![generic("two", &[b"ping", b"ping"], &["YQ==", "Yg=="])]);
        assert_eq!(store.match_request(b"ping").await, None);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_prepare_for_replay_normalizes_pool() {
        let startup = crate::protocol::postgres::tests::startup_message(&[("user", "app")]);
        let store = store(vec![generic("auth", &[&startup], &["Ug=="])]);

        assert_eq!(store.prepare_for_replay().await, 1);
        match &store.mocks().await[0].spec {
            MockSpec::Generic { responses, .. } => assert_eq!(
                responses[0].first_data(),
                Some(super::super::normalize::MD5_AUTH_REQUEST)
            ),
            other => panic!("unexpected spec {:?}", other),
        }
    }
}
