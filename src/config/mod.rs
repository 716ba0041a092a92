//! Per-service configuration files rendered from embedded templates.

mod generator;
mod templates;

pub use generator::{
    config_file_name, generate, generate_all, render_config, write_config, ConfigContext,
    RenderedConfig,
};
pub use templates::render;
