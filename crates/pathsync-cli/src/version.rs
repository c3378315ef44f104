pub const FULL: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+git.",
    env!("PATHSYNC_GIT_SHA"),
    env!("PATHSYNC_GIT_DIRTY")
);
