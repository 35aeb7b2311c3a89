//! Mock engine shared by unit tests

use super::{ContainerEngine, ContainerId, ContainerSpec, EngineError, ExecOutput, ResourceStats};
use async_trait::async_trait;
use mockall::mock;

mock! {
    pub Engine {}

    #[async_trait]
    impl ContainerEngine for Engine {
        fn name(&self) -> &'static str;
        async fn ping(&self) -> Result<(), EngineError>;
        async fn ensure_image(&self, image: &str) -> Result<(), EngineError>;
        async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError>;
        async fn write_file(
            &self,
            id: &ContainerId,
            path: &str,
            contents: &[u8],
        ) -> Result<(), EngineError>;
        async fn exec(
            &self,
            id: &ContainerId,
            command: &[String],
            stdin: &[u8],
            max_output_bytes: usize,
        ) -> Result<ExecOutput, EngineError>;
        async fn stats(&self, id: &ContainerId) -> Result<ResourceStats, EngineError>;
        async fn kill(&self, id: &ContainerId) -> Result<(), EngineError>;
        async fn remove(&self, id: &ContainerId) -> Result<(), EngineError>;
    }
}
