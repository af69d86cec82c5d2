use thiserror::Error;

/// Protocol-level errors that are safe to echo back to a client verbatim.
///
/// The `Display` string of each variant is the exact text carried in the
/// `error` field of an error frame. Anything that is *not* a `ClientError`
/// must be masked to `internal` before it reaches the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("bind first")]
    BindFirst,

    #[error("already bound")]
    Bound,

    #[error("bind requires app_id")]
    BindAppId,

    #[error("bind requires side")]
    BindSide,

    #[error("already allocated")]
    AlreadyAllocated,

    #[error("already claimed")]
    AlreadyClaimed,

    #[error("claim requires nameplate")]
    ClaimNameplate,

    #[error("cannot reclaim nameplate from the same side")]
    ReclaimNameplate,

    #[error("crowded")]
    NameplateCrowded,

    #[error("already released")]
    AlreadyReleased,

    #[error("release does not match claimed nameplate")]
    ReleaseNameplate,

    #[error("release requires a claimed nameplate")]
    ReleaseNotClaimed,

    #[error("already opened")]
    AlreadyOpened,

    #[error("open requires mailbox")]
    OpenMailbox,

    #[error("open a mailbox first")]
    OpenFirst,

    #[error("add requires phase")]
    AddPhase,

    #[error("add requires body")]
    AddBody,

    #[error("already closed")]
    AlreadyClosed,

    #[error("close does not match opened mailbox")]
    CloseMailbox,

    #[error("close requires an opened mailbox")]
    CloseOpenFirst,

    #[error("crowded")]
    MailboxCrowded,

    #[error("unknown type")]
    UnknownType,
}
