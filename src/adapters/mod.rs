use std::sync::Arc;

use crate::core::container::ContainerControl;

mod docker;
mod simulated;

pub use docker::DockerCli;
pub use simulated::SimulatedContainers;

pub fn get_container_control(docker_enabled: bool) -> Arc<dyn ContainerControl> {
    if docker_enabled {
        Arc::new(DockerCli::default())
    } else {
        Arc::new(SimulatedContainers::new())
    }
}
