use std::time::{Duration, Instant};

/// A physical connection together with the instants the pool tracks for it.
#[derive(Debug)]
pub struct TimeConnection<C> {
    pub connection: C,
    created_at: Instant,
    last_used: Instant,
}

impl<C> TimeConnection<C> {
    pub fn new(connection: C) -> Self {
        let now = Instant::now();
        Self {
            connection,
            created_at: now,
            last_used: now,
        }
    }

    /// Time since the driver opened this connection.
    #[inline]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection was last checked in.
    #[inline]
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    #[inline]
    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    #[inline]
    pub fn into_connection(self) -> C {
        self.connection
    }
}
