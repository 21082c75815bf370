//! # Schema Generator
//!
//! Generates the JSON Schema of the controller configuration file from the
//! Rust type definitions, so editors and CI can validate `controller.yaml`
//! before the controller ever sees it.
//!
//! ## Usage
//!
//! ```bash
//! # Generate the configuration schema
//! cargo run --bin schemagen > config/controller.schema.json
//! ```

use geo_config_controller::config::ControllerConfig;

fn main() {
    let schema = schemars::schema_for!(ControllerConfig);
    println!(
        "{}",
        serde_json::to_string_pretty(&schema).expect("schema serializes to JSON")
    );
}
