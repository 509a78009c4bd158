use tokio_util::sync::CancellationToken;

/// Monotonic number of a request within one controller. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl Generation {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Permission for one in-flight call to keep writing into the log.
///
/// Clones share the same flag, so the copy held by the ingestion task observes a
/// cancel issued through the controller.
#[derive(Debug, Clone)]
pub struct RequestToken {
    generation: Generation,
    cancel: CancellationToken,
}

impl RequestToken {
    fn new(generation: Generation) -> Self {
        Self {
            generation,
            cancel: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Resolves once the token has been severed.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    fn sever(&self) {
        self.cancel.cancel();
    }
}

/// Owner of the single live request token.
#[derive(Debug, Default)]
pub struct CancellationController {
    live: Option<RequestToken>,
    last_generation: u64,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Severs any previously issued token and mints a fresh live one.
    pub fn begin_token(&mut self) -> RequestToken {
        if let Some(previous) = self.live.take() {
            previous.sever();
        }

        self.last_generation = self.last_generation.saturating_add(1);
        let token = RequestToken::new(Generation::new(self.last_generation));
        self.live = Some(token.clone());
        token
    }

    /// Severs `token` if it is the live one. Stale tokens are ignored.
    pub fn cancel(&mut self, token: &RequestToken) -> bool {
        let is_current = self
            .live
            .as_ref()
            .is_some_and(|live| live.generation == token.generation);
        if !is_current {
            return false;
        }

        self.cancel_live().is_some()
    }

    /// Severs whichever token is live and returns its generation.
    pub fn cancel_live(&mut self) -> Option<Generation> {
        let live = self.live.take()?;
        live.sever();
        Some(live.generation)
    }

    pub fn is_live(&self, token: &RequestToken) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.generation == token.generation && live.is_live())
    }

    pub fn live_generation(&self) -> Option<Generation> {
        self.live.as_ref().map(RequestToken::generation)
    }
}
