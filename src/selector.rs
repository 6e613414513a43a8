// --- Next-image selection -------------------------------------------------
//
// Every GetNextImage request is answered by exactly one of three tiers, in
// strict order:
//   1) send-next queue  (one-shot overrides, FIFO, consumed when served)
//   2) loop queue       (rotating playlist, served entry moves to the tail)
//   3) random pick      (uniform over whatever is currently on disk)
//
// The available set is listed fresh from the media directory for every call,
// so queue entries can go stale at any time. Stale send-next entries are
// dropped as the scan passes them. Stale loop entries are skipped but kept,
// since the file may come back (re-upload, restored from archive).
//
// The selector itself does no I/O. Callers list the store first and then hold
// the selector lock only for the in-memory work.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

/// Uniform index chooser used by the random tier: given `len > 0`, return an
/// index in `0..len`.
pub type Pick = Box<dyn FnMut(usize) -> usize + Send>;

/// Snapshot of the item IDs currently present in the media store.
///
/// Kept sorted and de-duplicated so membership is a binary search and the
/// random tier can choose by index.
#[derive(Debug, Clone, Default)]
pub struct Available {
    ids: Vec<String>,
}

impl Available {
    pub fn new(ids: impl IntoIterator<Item = String>) -> Self {
        let mut ids: Vec<String> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        Self { ids }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.binary_search_by(|probe| probe.as_str().cmp(id)).is_ok()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

impl FromIterator<String> for Available {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Which tier produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    SendNext,
    Loop,
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub id: String,
    pub source: Source,
    /// True only on the first selection after `trigger_fun`.
    pub fun: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("no images available")]
    NoContent,

    #[error("image not found: {0}")]
    UnknownItem(String),

    #[error("image is not in the loop queue: {0}")]
    NotInLoop(String),
}

pub struct Selector {
    send_next: VecDeque<String>,
    loop_queue: VecDeque<String>,
    fun: bool,
    pick: Pick,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector {
    pub fn new() -> Self {
        Self::with_pick(Box::new(|len: usize| fastrand::usize(..len)))
    }

    /// Build a selector with a caller-supplied random source (tests use a
    /// fixed index).
    pub fn with_pick(pick: Pick) -> Self {
        Self {
            send_next: VecDeque::new(),
            loop_queue: VecDeque::new(),
            fun: false,
            pick,
        }
    }

    /// Choose the next image and apply the queue side effects.
    ///
    /// The fun flag is only consumed when an image is actually returned; a
    /// `NoContent` answer leaves it armed for the next successful call.
    pub fn select_next(&mut self, available: &Available) -> Result<Selection, SelectorError> {
        let (id, source) = self.choose(available).ok_or(SelectorError::NoContent)?;
        let fun = std::mem::take(&mut self.fun);
        Ok(Selection { id, source, fun })
    }

    fn choose(&mut self, available: &Available) -> Option<(String, Source)> {
        while let Some(id) = self.send_next.pop_front() {
            if available.contains(&id) {
                return Some((id, Source::SendNext));
            }
            debug!(%id, "dropping stale send-next entry");
        }

        if let Some(pos) = self.loop_queue.iter().position(|id| available.contains(id)) {
            if let Some(id) = self.loop_queue.remove(pos) {
                self.loop_queue.push_back(id.clone());
                return Some((id, Source::Loop));
            }
        }

        if available.is_empty() {
            return None;
        }
        let last = available.len() - 1;
        let idx = (self.pick)(available.len()).min(last);
        Some((available.ids[idx].clone(), Source::Random))
    }

    pub fn enqueue_send_next(&mut self, id: &str, available: &Available) -> Result<(), SelectorError> {
        if !available.contains(id) {
            return Err(SelectorError::UnknownItem(id.to_string()));
        }
        self.send_next.push_back(id.to_string());
        Ok(())
    }

    /// Append to the loop queue. The same image may be queued several times,
    /// which makes it come round proportionally more often.
    pub fn enqueue_loop(&mut self, id: &str, available: &Available) -> Result<(), SelectorError> {
        if !available.contains(id) {
            return Err(SelectorError::UnknownItem(id.to_string()));
        }
        self.loop_queue.push_back(id.to_string());
        Ok(())
    }

    /// Remove the first occurrence of `id` from the loop queue.
    pub fn remove_from_loop(&mut self, id: &str) -> Result<(), SelectorError> {
        let pos = self
            .loop_queue
            .iter()
            .position(|queued| queued == id)
            .ok_or_else(|| SelectorError::NotInLoop(id.to_string()))?;
        self.loop_queue.remove(pos);
        Ok(())
    }

    pub fn clear_send_next(&mut self) {
        self.send_next.clear();
    }

    pub fn clear_loop(&mut self) {
        self.loop_queue.clear();
    }

    pub fn trigger_fun(&mut self) {
        self.fun = true;
    }

    pub fn fun_pending(&self) -> bool {
        self.fun
    }

    pub fn peek_send_next(&self) -> Vec<String> {
        self.send_next.iter().cloned().collect()
    }

    pub fn peek_loop(&self) -> Vec<String> {
        self.loop_queue.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avail(ids: &[&str]) -> Available {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn first_pick() -> Selector {
        Selector::with_pick(Box::new(|_: usize| 0))
    }

    #[test]
    fn random_tier_returns_a_member_of_the_available_set() {
        let available = avail(&["a.png", "b.png", "c.png"]);
        let mut sel = Selector::new();
        for _ in 0..50 {
            let pick = sel.select_next(&available).unwrap();
            assert!(available.contains(&pick.id));
            assert_eq!(pick.source, Source::Random);
        }
        assert!(sel.peek_send_next().is_empty());
        assert!(sel.peek_loop().is_empty());
    }

    #[test]
    fn random_tier_uses_the_injected_pick() {
        let available = avail(&["c.png", "a.png", "b.png"]);
        let mut sel = Selector::with_pick(Box::new(|len: usize| len - 1));
        assert_eq!(sel.select_next(&available).unwrap().id, "c.png");
    }

    #[test]
    fn out_of_range_pick_is_clamped() {
        let available = avail(&["a.png", "b.png"]);
        let mut sel = Selector::with_pick(Box::new(|_: usize| 99));
        assert_eq!(sel.select_next(&available).unwrap().id, "b.png");
    }

    #[test]
    fn empty_store_is_no_content() {
        let mut sel = first_pick();
        assert_eq!(sel.select_next(&Available::default()), Err(SelectorError::NoContent));
    }

    #[test]
    fn send_next_is_served_in_order_and_consumed() {
        let available = avail(&["a.png", "b.png", "z.png"]);
        let mut sel = first_pick();
        sel.enqueue_send_next("a.png", &available).unwrap();
        sel.enqueue_send_next("b.png", &available).unwrap();
        sel.enqueue_loop("z.png", &available).unwrap();

        let first = sel.select_next(&available).unwrap();
        assert_eq!((first.id.as_str(), first.source), ("a.png", Source::SendNext));
        assert_eq!(sel.peek_send_next(), vec!["b.png"]);

        let second = sel.select_next(&available).unwrap();
        assert_eq!((second.id.as_str(), second.source), ("b.png", Source::SendNext));
        assert!(sel.peek_send_next().is_empty());

        assert_eq!(sel.select_next(&available).unwrap().source, Source::Loop);
    }

    #[test]
    fn stale_send_next_entry_is_dropped_and_selection_falls_through() {
        let mut sel = first_pick();
        sel.enqueue_send_next("x.png", &avail(&["x.png"])).unwrap();

        let available = avail(&["a.png"]);
        let pick = sel.select_next(&available).unwrap();
        assert_eq!((pick.id.as_str(), pick.source), ("a.png", Source::Random));
        assert!(sel.peek_send_next().is_empty());

        // Coming back later does not resurrect it.
        let pick = sel.select_next(&avail(&["a.png", "x.png"])).unwrap();
        assert_eq!(pick.source, Source::Random);
    }

    #[test]
    fn stale_entries_ahead_of_a_live_one_are_all_dropped() {
        let mut sel = first_pick();
        let all = avail(&["gone1", "gone2", "live", "after"]);
        for id in ["gone1", "gone2", "live", "after"] {
            sel.enqueue_send_next(id, &all).unwrap();
        }
        let pick = sel.select_next(&avail(&["live", "after"])).unwrap();
        assert_eq!((pick.id.as_str(), pick.source), ("live", Source::SendNext));
        // Only the entries ahead of the served one are consumed.
        assert_eq!(sel.peek_send_next(), vec!["after"]);
    }

    #[test]
    fn loop_rotates_through_every_entry() {
        let available = avail(&["p", "q", "r"]);
        let mut sel = first_pick();
        for id in ["p", "q", "r"] {
            sel.enqueue_loop(id, &available).unwrap();
        }

        let served: Vec<String> = (0..4)
            .map(|_| {
                let pick = sel.select_next(&available).unwrap();
                assert_eq!(pick.source, Source::Loop);
                assert_eq!(sel.peek_loop().len(), 3);
                pick.id
            })
            .collect();
        assert_eq!(served, vec!["p", "q", "r", "p"]);
    }

    #[test]
    fn unavailable_loop_entry_is_skipped_but_kept() {
        let mut sel = Selector::with_pick(Box::new(|_: usize| 0));
        sel.enqueue_loop("m", &avail(&["m"])).unwrap();

        let pick = sel.select_next(&avail(&["other"])).unwrap();
        assert_eq!((pick.id.as_str(), pick.source), ("other", Source::Random));
        assert_eq!(sel.peek_loop(), vec!["m"]);

        let pick = sel.select_next(&avail(&["m", "other"])).unwrap();
        assert_eq!((pick.id.as_str(), pick.source), ("m", Source::Loop));
    }

    #[test]
    fn skipped_loop_entry_keeps_its_position() {
        let all = avail(&["p", "q", "r"]);
        let mut sel = first_pick();
        for id in ["p", "q", "r"] {
            sel.enqueue_loop(id, &all).unwrap();
        }
        assert_eq!(sel.select_next(&avail(&["q", "r"])).unwrap().id, "q");
        assert_eq!(sel.peek_loop(), vec!["p", "r", "q"]);
    }

    #[test]
    fn duplicate_loop_entries_are_served_proportionally() {
        let available = avail(&["a", "b"]);
        let mut sel = first_pick();
        for id in ["a", "a", "b"] {
            sel.enqueue_loop(id, &available).unwrap();
        }
        let served: Vec<String> = (0..6).map(|_| sel.select_next(&available).unwrap().id).collect();
        assert_eq!(served, vec!["a", "a", "b", "a", "a", "b"]);
    }

    #[test]
    fn fun_flag_rides_on_exactly_one_selection() {
        let available = avail(&["a"]);
        let mut sel = first_pick();
        sel.trigger_fun();
        sel.trigger_fun();
        assert!(sel.fun_pending());

        assert!(sel.select_next(&available).unwrap().fun);
        assert!(!sel.fun_pending());
        assert!(!sel.select_next(&available).unwrap().fun);
    }

    #[test]
    fn fun_flag_survives_an_empty_store() {
        let mut sel = first_pick();
        sel.trigger_fun();
        assert!(sel.select_next(&Available::default()).is_err());
        assert!(sel.select_next(&avail(&["a"])).unwrap().fun);
    }

    #[test]
    fn enqueue_rejects_unknown_items_without_touching_queues() {
        let available = avail(&["a"]);
        let mut sel = first_pick();
        sel.enqueue_send_next("a", &available).unwrap();
        sel.enqueue_loop("a", &available).unwrap();

        assert_eq!(
            sel.enqueue_send_next("missing", &available),
            Err(SelectorError::UnknownItem("missing".into()))
        );
        assert_eq!(
            sel.enqueue_loop("missing", &available),
            Err(SelectorError::UnknownItem("missing".into()))
        );
        assert_eq!(sel.peek_send_next(), vec!["a"]);
        assert_eq!(sel.peek_loop(), vec!["a"]);
    }

    #[test]
    fn remove_from_loop_takes_first_occurrence_only() {
        let available = avail(&["a", "b"]);
        let mut sel = first_pick();
        for id in ["a", "b", "a"] {
            sel.enqueue_loop(id, &available).unwrap();
        }
        sel.remove_from_loop("a").unwrap();
        assert_eq!(sel.peek_loop(), vec!["b", "a"]);
        assert_eq!(sel.remove_from_loop("zzz"), Err(SelectorError::NotInLoop("zzz".into())));
    }

    #[test]
    fn clears_are_idempotent() {
        let available = avail(&["a"]);
        let mut sel = first_pick();
        sel.enqueue_send_next("a", &available).unwrap();
        sel.enqueue_loop("a", &available).unwrap();
        sel.clear_send_next();
        sel.clear_send_next();
        sel.clear_loop();
        sel.clear_loop();
        assert!(sel.peek_send_next().is_empty());
        assert!(sel.peek_loop().is_empty());
    }

    #[test]
    fn available_sorts_and_dedups() {
        let available = avail(&["b", "a", "b"]);
        assert_eq!(available.ids(), ["a", "b"]);
        assert!(available.contains("a"));
        assert!(!available.contains("c"));
    }
}
