use super::{json_pretty, load_manifest, EXIT_SUCCESS};
use kiln_core::{unique_step_name, BuildConfig};
use kiln_schema::Manifest;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct PlannedStep {
    label: String,
    name: String,
    image: String,
    depends_on: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Plan {
    build_id: String,
    privileged: bool,
    levels: Vec<Vec<PlannedStep>>,
}

fn plan(manifest: &Manifest, config: &BuildConfig) -> Plan {
    let build_id = config.build_id();
    let levels = manifest
        .levels()
        .iter()
        .map(|level| {
            level
                .iter()
                .map(|&idx| {
                    let step = manifest.step(idx);
                    PlannedStep {
                        label: step.label.clone(),
                        name: step.name.clone(),
                        image: unique_step_name(&step.name, &build_id),
                        depends_on: manifest
                            .dependencies(idx)
                            .iter()
                            .map(|&dep| manifest.step(dep).name.clone())
                            .collect(),
                    }
                })
                .collect()
        })
        .collect();
    Plan {
        build_id: build_id.to_string(),
        privileged: manifest.is_privileged,
        levels,
    }
}

pub fn run(config: &BuildConfig, json: bool) -> Result<u8, String> {
    let manifest = load_manifest(config)?;
    let plan = plan(&manifest, config);

    if json {
        println!("{}", json_pretty(&plan)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("build id: {}", plan.build_id);
    for (idx, level) in plan.levels.iter().enumerate() {
        println!("level {idx}:");
        for step in level {
            if step.depends_on.is_empty() {
                println!("  {} -> {}", step.name, step.image);
            } else {
                println!(
                    "  {} -> {} (after {})",
                    step.name,
                    step.image,
                    step.depends_on.join(", ")
                );
            }
        }
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_schema::{parse_manifest_str, LoadOptions};

    #[test]
    fn plan_names_images_per_build_id() {
        let manifest = parse_manifest_str(
            r"
build:
  version: 2016-02-13
  steps:
    base:
      name: base
    app:
      name: registry.local/app:2.0
      depends_on: [base]
",
            &LoadOptions::default(),
        )
        .unwrap();
        let config = BuildConfig {
            unique_id: Some("CI42".to_owned()),
            ..BuildConfig::default()
        };
        let plan = plan(&manifest, &config);
        assert_eq!(plan.build_id, "ci42");
        assert_eq!(plan.levels.len(), 2);
        assert_eq!(plan.levels[0][0].image, "base-ci42");
        assert_eq!(plan.levels[1][0].image, "registry.local/app-ci42:2.0");
        assert_eq!(plan.levels[1][0].depends_on, vec!["base"]);
        assert!(!plan.privileged);
    }
}
