use snafu::{Snafu, ensure};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// One message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Misuse of the log contract. Any of these means the controller has a bug.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LogError {
    #[snafu(display("no active turn to write into on `{stage}`"))]
    NoActiveTurn { stage: &'static str },
    #[snafu(display("conversation log is empty on `{stage}`"))]
    NothingToTruncate { stage: &'static str },
    #[snafu(display("assistant turn at index {index} is still active on `{stage}`"))]
    AssistantAlreadyActive { stage: &'static str, index: usize },
    #[snafu(display("tail turn is still active on `{stage}`"))]
    TailStillActive { stage: &'static str },
}

pub type LogResult<T> = Result<T, LogError>;

/// Ordered turn log whose only mutable entry is an active assistant tail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationLog {
    turns: Vec<Turn>,
    // Only ever `turns.len() - 1` when set.
    active: Option<usize>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a turn. Assistant turns become the active tail.
    pub fn append(&mut self, turn: Turn) -> LogResult<()> {
        if let Some(index) = self.active {
            ensure!(
                turn.role != Role::Assistant,
                AssistantAlreadyActiveSnafu {
                    stage: "append-assistant",
                    index,
                }
            );
            return TailStillActiveSnafu {
                stage: "append-user",
            }
            .fail();
        }

        let is_assistant = turn.role == Role::Assistant;
        self.turns.push(turn);
        if is_assistant {
            self.active = Some(self.turns.len() - 1);
        }
        Ok(())
    }

    pub fn append_to_active(&mut self, text: &str) -> LogResult<()> {
        let turn = self.active_turn_mut("append-to-active")?;
        turn.content.push_str(text);
        Ok(())
    }

    /// Replaces whatever the active turn holds, used for the failure fallback.
    pub fn overwrite_active(&mut self, text: &str) -> LogResult<()> {
        let turn = self.active_turn_mut("overwrite-active")?;
        turn.content.clear();
        turn.content.push_str(text);
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.active = None;
    }

    pub fn truncate_last(&mut self) -> LogResult<Turn> {
        ensure!(
            self.active.is_none(),
            TailStillActiveSnafu {
                stage: "truncate-last",
            }
        );

        self.turns.pop().ok_or_else(|| {
            NothingToTruncateSnafu {
                stage: "truncate-last",
            }
            .build()
        })
    }

    pub fn find_last_user_turn(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|turn| turn.role == Role::User)
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn active_turn_mut(&mut self, stage: &'static str) -> LogResult<&mut Turn> {
        let Some(index) = self.active else {
            return NoActiveTurnSnafu { stage }.fail();
        };

        self.turns
            .get_mut(index)
            .ok_or_else(|| NoActiveTurnSnafu { stage }.build())
    }
}
