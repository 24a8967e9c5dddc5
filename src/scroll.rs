//! Auto-scroll follower for the chat panel.
//!
//! Follows the newest message until the viewer scrolls away from the bottom;
//! stays put until they scroll back within the threshold or jump to latest.

/// What the view should do after new messages are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAction {
    /// Scroll so the newest entry is visible.
    FollowNewest,
    /// Leave the position alone; `unseen` messages arrived since the viewer
    /// scrolled away.
    Hold { unseen: usize },
}

#[derive(Debug, Clone)]
pub struct ScrollFollower {
    threshold_px: f64,
    following: bool,
    unseen: usize,
}

impl ScrollFollower {
    pub fn new(threshold_px: f64) -> Self {
        Self { threshold_px, following: true, unseen: 0 }
    }

    pub fn is_following(&self) -> bool {
        self.following
    }

    pub fn unseen(&self) -> usize {
        self.unseen
    }

    /// Record a viewer scroll. Returns whether auto-follow is now active.
    pub fn on_user_scroll(&mut self, scroll_top: f64, scroll_height: f64, client_height: f64) -> bool {
        let from_bottom = scroll_height - scroll_top - client_height;
        self.following = from_bottom < self.threshold_px;
        if self.following {
            self.unseen = 0;
        }
        self.following
    }

    pub fn on_messages_arrived(&mut self, count: usize) -> ScrollAction {
        if self.following {
            ScrollAction::FollowNewest
        } else {
            self.unseen += count;
            ScrollAction::Hold { unseen: self.unseen }
        }
    }

    /// Explicit "jump to latest": resume following regardless of position.
    pub fn jump_to_latest(&mut self) -> ScrollAction {
        self.following = true;
        self.unseen = 0;
        ScrollAction::FollowNewest
    }
}

impl Default for ScrollFollower {
    fn default() -> Self {
        Self::new(50.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn follows_by_default() {
        let mut s = ScrollFollower::default();
        assert_eq!(s.on_messages_arrived(3), ScrollAction::FollowNewest);
    }

    #[rstest]
    #[case(960.0, true)] // 40px from bottom
    #[case(950.0, false)] // exactly 50px
    #[case(500.0, false)]
    #[case(1000.0, true)]
    fn threshold_decides_following(#[case] top: f64, #[case] expected: bool) {
        let mut s = ScrollFollower::new(50.0);
        assert_eq!(s.on_user_scroll(top, 1_500.0, 500.0), expected);
    }

    #[test]
    fn manual_scroll_suspends_until_jump() {
        let mut s = ScrollFollower::default();
        s.on_user_scroll(100.0, 2_000.0, 500.0);
        assert_eq!(s.on_messages_arrived(2), ScrollAction::Hold { unseen: 2 });
        assert_eq!(s.on_messages_arrived(1), ScrollAction::Hold { unseen: 3 });
        assert_eq!(s.jump_to_latest(), ScrollAction::FollowNewest);
        assert_eq!(s.on_messages_arrived(1), ScrollAction::FollowNewest);
        assert_eq!(s.unseen(), 0);
    }

    #[test]
    fn five_arrivals_while_scrolled_away_hold_position() {
        let mut s = ScrollFollower::default();
        assert!(!s.on_user_scroll(200.0, 2_000.0, 500.0));
        for n in 1..=5 {
            assert_eq!(s.on_messages_arrived(1), ScrollAction::Hold { unseen: n });
        }
        assert!(!s.is_following());
        assert_eq!(s.jump_to_latest(), ScrollAction::FollowNewest);
        assert!(s.is_following());
        assert_eq!(s.on_messages_arrived(5), ScrollAction::FollowNewest);
    }

    #[test]
    fn returning_to_bottom_resumes() {
        let mut s = ScrollFollower::default();
        s.on_user_scroll(0.0, 2_000.0, 500.0);
        assert!(!s.is_following());
        s.on_user_scroll(1_490.0, 2_000.0, 500.0);
        assert!(s.is_following());
    }
}
