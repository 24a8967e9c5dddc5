//! # Stage: Timeline Merge
//!
//! ## Responsibility
//! Combine filler, remote and locally-authored messages into one ordered
//! timeline, and slice the rendered window from it.
//!
//! ## Guarantees
//! - Output is sorted by send time ascending; equal keys keep concatenation
//!   order (filler, then remote, then local)
//! - Pure: the same three inputs always produce the same timeline
//! - Locally-authored messages are never dropped
//!
//! ## NOT Responsible For
//! - Fetching or generating the inputs
//! - Persisting the result

use std::collections::HashSet;

use crate::config::SyncConfig;
use crate::message::ChatMessage;

/// Knobs applied on top of the sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    /// Keep only the first entry for each id.
    pub dedup_by_id: bool,
    /// Drop remote entries that echo a local one within this window. `0`
    /// disables.
    pub echo_window_ms: u64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self { dedup_by_id: true, echo_window_ms: 0 }
    }
}

impl From<&SyncConfig> for MergeOptions {
    fn from(cfg: &SyncConfig) -> Self {
        Self { dedup_by_id: cfg.dedup_by_id, echo_window_ms: cfg.echo_window_ms }
    }
}

fn is_echo(remote: &ChatMessage, local: &[ChatMessage], window_ms: u64) -> bool {
    if window_ms == 0 {
        return false;
    }
    local.iter().any(|l| {
        l.author == remote.author
            && l.body == remote.body
            && l.sort_key_ms().abs_diff(remote.sort_key_ms()) <= window_ms
    })
}

/// Merge the three producers into one timeline.
pub fn merge(
    filler: &[ChatMessage],
    remote: &[ChatMessage],
    local: &[ChatMessage],
    opts: &MergeOptions,
) -> Vec<ChatMessage> {
    let mut all: Vec<ChatMessage> = Vec::with_capacity(filler.len() + remote.len() + local.len());
    all.extend_from_slice(filler);
    all.extend(remote.iter().filter(|r| !is_echo(r, local, opts.echo_window_ms)).cloned());
    all.extend_from_slice(local);

    // sort_by_key is stable.
    all.sort_by_key(ChatMessage::sort_key_ms);

    if opts.dedup_by_id {
        let mut seen = HashSet::with_capacity(all.len());
        all.retain(|m| seen.insert(m.id.clone()));
    }
    all
}

/// The last `n` entries of an ascending timeline, newest first.
pub fn visible(timeline: &[ChatMessage], n: usize) -> Vec<&ChatMessage> {
    timeline.iter().rev().take(n).collect()
}

/// A published timeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    /// Ascending by send time.
    pub messages: Vec<ChatMessage>,
    /// Sync cycles completed when this value was published; `0` for a
    /// restored history.
    pub cycle: u64,
    /// Whether the last fetch attempt succeeded.
    pub remote_ok: bool,
}

impl Timeline {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// See [`visible`].
    pub fn visible(&self, n: usize) -> Vec<&ChatMessage> {
        visible(&self.messages, n)
    }

    pub fn newest(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

/// `[HH:MM] author: body`, with a `*` marking privileged authors.
pub fn format_entry(m: &ChatMessage) -> String {
    let badge = if m.is_privileged { "*" } else { "" };
    format!("[{}] {}{}: {}", m.sent_at.render_clock(), m.author, badge, m.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Origin, SentAt};
    use proptest::prelude::*;
    use rstest::rstest;

    fn msg(id: &str, at: i64, origin: Origin) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            author: format!("author-{id}"),
            body: format!("body-{id}"),
            sent_at: SentAt::from_ms(at),
            origin,
            is_privileged: false,
        }
    }

    fn ids(v: &[ChatMessage]) -> Vec<&str> {
        v.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn remote_then_later_local_orders_ascending() {
        let t0 = 1_000_000;
        let remote = [msg("A", t0, Origin::Remote)];
        let local = [msg("L", t0 + 5_000, Origin::LocalUser)];
        let out = merge(&[], &remote, &local, &MergeOptions::default());
        assert_eq!(ids(&out), ["A", "L"]);
        let shown: Vec<&str> = visible(&out, 15).iter().map(|m| m.id.as_str()).collect();
        assert_eq!(shown, ["L", "A"]);
    }

    #[test]
    fn ties_keep_concatenation_order() {
        let f = [msg("f", 10, Origin::Synthetic)];
        let r = [msg("r", 10, Origin::Remote)];
        let l = [msg("l", 10, Origin::LocalUser)];
        assert_eq!(ids(&merge(&f, &r, &l, &MergeOptions::default())), ["f", "r", "l"]);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let r = [msg("x", 5, Origin::Remote), msg("x", 9, Origin::Remote)];
        let out = merge(&[], &r, &[], &MergeOptions::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sort_key_ms(), 5);

        let keep_all = MergeOptions { dedup_by_id: false, ..MergeOptions::default() };
        assert_eq!(merge(&[], &r, &[], &keep_all).len(), 2);
    }

    #[rstest]
    #[case(0, 2)]
    #[case(10_000, 1)]
    #[case(1_000, 2)]
    fn echo_suppression_window(#[case] window_ms: u64, #[case] expected_len: usize) {
        let local = msg("l", 100_000, Origin::LocalUser);
        let echo = ChatMessage {
            id: "remote-1".into(),
            origin: Origin::Remote,
            sent_at: SentAt::from_ms(103_000),
            ..local.clone()
        };
        let opts = MergeOptions { dedup_by_id: true, echo_window_ms: window_ms };
        let out = merge(&[], &[echo], &[local], &opts);
        assert_eq!(out.len(), expected_len);
        assert!(out.iter().any(|m| m.is_local()));
    }

    #[test]
    fn merge_is_idempotent_for_same_inputs() {
        let r = [msg("b", 20, Origin::Remote), msg("a", 10, Origin::Remote)];
        let l = [msg("l", 15, Origin::LocalUser)];
        let opts = MergeOptions::default();
        assert_eq!(merge(&[], &r, &l, &opts), merge(&[], &r, &l, &opts));
    }

    #[test]
    fn visible_window_is_newest_first_and_bounded() {
        let all: Vec<_> = (0..20).map(|i| msg(&i.to_string(), i, Origin::Remote)).collect();
        let shown = visible(&all, 15);
        assert_eq!(shown.len(), 15);
        assert_eq!(shown[0].id, "19");
        assert_eq!(shown[14].id, "5");
    }

    #[test]
    fn format_entry_marks_privileged() {
        let mut m = msg("a", 0, Origin::Remote);
        m.is_privileged = true;
        assert!(format_entry(&m).contains("author-a*: body-a"));
    }

    fn arb_batch(prefix: &'static str, origin: Origin) -> impl Strategy<Value = Vec<ChatMessage>> {
        prop::collection::vec(0i64..1_000, 0..30).prop_map(move |times| {
            times
                .into_iter()
                .enumerate()
                .map(|(i, t)| msg(&format!("{prefix}{i}"), t, origin))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn merged_timeline_is_sorted(
            f in arb_batch("f", Origin::Synthetic),
            r in arb_batch("r", Origin::Remote),
            l in arb_batch("l", Origin::LocalUser),
        ) {
            let out = merge(&f, &r, &l, &MergeOptions::default());
            prop_assert!(out.windows(2).all(|w| w[0].sort_key_ms() <= w[1].sort_key_ms()));
        }

        #[test]
        fn every_local_message_survives(
            r in arb_batch("r", Origin::Remote),
            l in arb_batch("l", Origin::LocalUser),
        ) {
            let opts = MergeOptions { dedup_by_id: true, echo_window_ms: 10_000 };
            let out = merge(&[], &r, &l, &opts);
            for m in &l {
                prop_assert!(out.iter().any(|o| o.id == m.id));
            }
        }

        #[test]
        fn no_duplicate_ids_when_dedup_on(
            r in arb_batch("x", Origin::Remote),
            r2 in arb_batch("x", Origin::Remote),
        ) {
            let out = merge(&r, &r2, &[], &MergeOptions::default());
            let unique: HashSet<_> = out.iter().map(|m| m.id.clone()).collect();
            prop_assert_eq!(unique.len(), out.len());
        }
    }
}
