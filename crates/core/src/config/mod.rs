// crates/core/src/config/mod.rs
pub mod run_config;

pub use run_config::{
    DataConfig, DistributedConfig, H5SourceConfig, LoaderConfig, Op, RunConfig, RunOverrides, TrainModelConfig,
};

/// Convert YAML to JSON - utility for CLI validation
pub fn yaml_to_json(yaml_str: &str) -> anyhow::Result<String> {
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(yaml_str)
        .map_err(|e| anyhow::anyhow!("Failed to parse YAML: {}", e))?;
    serde_json::to_string_pretty(&yaml_value)
        .map_err(|e| anyhow::anyhow!("Failed to convert to JSON: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_converts_to_pretty_json() {
        let json = yaml_to_json("ops: [train]\nlr: 0.5\n").unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["ops"][0], "train");
        assert_eq!(value["lr"], 0.5);
        assert!(yaml_to_json("ops: [train").is_err());
    }
}
