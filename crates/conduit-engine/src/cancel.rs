pub use tokio_util::sync::CancellationToken;

/// Cancellation scope for the branches of one fan-out. Cancelling the parent
/// (a paused run, or an enclosing fan-out that already decided) reaches
/// every branch; deciding this fan-out cancels only its own branches.
#[derive(Clone, Debug)]
pub(crate) struct BranchGroup {
    parent: CancellationToken,
    group: CancellationToken,
}

impl BranchGroup {
    pub(crate) fn new(parent: &CancellationToken) -> Self {
        Self {
            parent: parent.clone(),
            group: parent.child_token(),
        }
    }

    pub(crate) fn branch_token(&self) -> CancellationToken {
        self.group.child_token()
    }

    /// Stops the remaining branches. Running handler calls finish first.
    pub(crate) fn cancel_remaining(&self) {
        self.group.cancel();
    }

    pub(crate) fn parent_cancelled(&self) -> bool {
        self.parent.is_cancelled()
    }
}
