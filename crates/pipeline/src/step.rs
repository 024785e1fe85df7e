use crate::Request;

/// A unit of desired-state computation. Steps run in registration order and
/// may read what earlier steps wrote. They must not keep state across runs.
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// An error aborts the whole run without committing anything.
    async fn apply(&self, req: &mut dyn Request) -> anyhow::Result<()>;
}
