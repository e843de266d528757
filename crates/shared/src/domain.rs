use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(CommentId);
id_newtype!(UserId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Agree,
    Disagree,
    Skip,
}

impl VoteChoice {
    pub const ALL: [VoteChoice; 3] = [VoteChoice::Agree, VoteChoice::Disagree, VoteChoice::Skip];

    pub fn value(self) -> i8 {
        match self {
            VoteChoice::Agree => 1,
            VoteChoice::Disagree => -1,
            VoteChoice::Skip => 0,
        }
    }

    pub fn from_value(value: i8) -> Option<Self> {
        match value {
            1 => Some(VoteChoice::Agree),
            -1 => Some(VoteChoice::Disagree),
            0 => Some(VoteChoice::Skip),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VoteChoice::Agree => "Agree",
            VoteChoice::Disagree => "Disagree",
            VoteChoice::Skip => "Skip",
        }
    }
}

impl fmt::Display for VoteChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
