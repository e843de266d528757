use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipationProgress {
    voted: u32,
    total: usize,
}

impl ParticipationProgress {
    pub fn new(voted: u32, total: usize) -> Self {
        Self { voted, total }
    }

    pub fn current_ordinal(&self) -> u32 {
        self.voted.saturating_add(1)
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.voted as usize)
    }
}

impl fmt::Display for ParticipationProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} comments", self.current_ordinal(), self.total)
    }
}
