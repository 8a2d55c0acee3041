use super::{json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use kiln_core::shutdown_requested;
use kiln_squash::{validate_tag, SquashFrom, Squasher};
use std::path::Path;

pub fn run(
    input: &Path,
    output: Option<&Path>,
    tag: Option<&str>,
    from: Option<SquashFrom>,
    json: bool,
) -> Result<u8, String> {
    if let Some(tag) = tag {
        validate_tag(tag).map_err(|e| e.to_string())?;
    }

    let mut squasher = Squasher::new().interrupt_check(shutdown_requested);
    if let Some(from) = from {
        squasher = squasher.from_layer(from);
    }

    // the squashed tar goes to stdout without -o, so progress and results
    // stay off it
    let pb = if json || output.is_none() {
        None
    } else {
        Some(spinner(&format!("squashing {}...", input.display())))
    };

    let report = match squasher.squash_file(input, output, tag) {
        Ok(r) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "image squashed");
            }
            r
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "squash failed");
            }
            return Err(e.to_string());
        }
    };

    if json {
        let payload = json_pretty(&report)?;
        if output.is_some() {
            println!("{payload}");
        } else {
            eprintln!("{payload}");
        }
    } else if output.is_some() {
        match &report.new_layer {
            Some(layer) => println!(
                "merged {} layer(s) above {} into {}",
                report.merged_layers,
                report.squash_point.short(),
                layer.short()
            ),
            None => println!(
                "nothing to squash above {}",
                report.squash_point.short()
            ),
        }
        if let Some(tag) = &report.tag {
            println!("tagged {tag}");
        }
    }
    Ok(EXIT_SUCCESS)
}
