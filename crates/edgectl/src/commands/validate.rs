use serde::Serialize;

use edgectl_config::load_settings;
use edgectl_core::{SiteConfig, Skipped};

use crate::cli::{GlobalOpts, OutputFormat, ValidateArgs};
use crate::commands::config_file;
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct Report<'a> {
    config: String,
    controller_id: &'a str,
    devices: Vec<&'a str>,
    rules: Vec<RuleLine<'a>>,
    skipped_devices: &'a [Skipped],
    skipped_rules: &'a [Skipped],
}

#[derive(Debug, Serialize)]
struct RuleLine<'a> {
    id: &'a str,
    kind: String,
    priority: i32,
    active: bool,
}

pub fn handle(args: &ValidateArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = config_file(global);
    let settings = load_settings(&path)?;
    let config = settings.to_controller_config()?;
    let site = SiteConfig::from_definition(settings.site_definition());

    if args.dump {
        let mut effective = serde_json::to_value(&settings)?;
        if let Some(password) = effective.pointer_mut("/broker/password") {
            if !password.is_null() {
                *password = "********".into();
            }
        }
        println!("{}", serde_json::to_string_pretty(&effective)?);
        return Ok(());
    }

    let report = Report {
        config: path.display().to_string(),
        controller_id: &config.controller_id,
        devices: site.devices().iter().map(|d| d.id.as_str()).collect(),
        rules: site
            .rules()
            .iter()
            .map(|r| RuleLine {
                id: &r.id,
                kind: r.kind.tag().to_string(),
                priority: r.priority,
                active: r.active,
            })
            .collect(),
        skipped_devices: site.skipped_devices(),
        skipped_rules: site.skipped_rules(),
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render_text(&report)),
    }
    Ok(())
}

fn render_text(report: &Report<'_>) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(out, "config:     {}", report.config);
    let _ = writeln!(out, "controller: {}", report.controller_id);
    let _ = writeln!(
        out,
        "devices:    {} accepted, {} skipped",
        report.devices.len(),
        report.skipped_devices.len()
    );
    let _ = writeln!(
        out,
        "rules:      {} accepted, {} skipped",
        report.rules.len(),
        report.skipped_rules.len()
    );

    if !report.rules.is_empty() {
        let _ = writeln!(out, "\nevaluation order:");
        for rule in &report.rules {
            let flag = if rule.active { "" } else { " (inactive)" };
            let _ = writeln!(
                out,
                "  {:>5}  {:<15} {}{flag}",
                rule.priority, rule.kind, rule.id
            );
        }
    }

    for (label, skipped) in [
        ("skipped devices", report.skipped_devices),
        ("skipped rules", report.skipped_rules),
    ] {
        if skipped.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n{label}:");
        for entry in skipped {
            let _ = writeln!(out, "  {}: {}", entry.id, entry.reason);
        }
    }
    out
}
