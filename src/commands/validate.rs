//! `capstan validate`: schema and dependency checks over a catalog.

use crate::Context;
use crate::catalog::{Catalog, CatalogError, DefinitionDefaults, DependencyReport, FileReport};
use crate::cli::ValidateArgs;
use crate::render::Renderer;
use crate::ui;
use anyhow::Result;
use colored::Colorize;
use std::path::Path;

pub fn run(ctx: &Context, args: ValidateArgs) -> Result<u8> {
    let root = args.path.unwrap_or_else(|| ctx.catalog_dir());
    let catalog = Catalog::load(&root, &ctx.config.allowed_capabilities())?;

    if catalog.files.is_empty() {
        ui::error(&format!("No operation files found under {}", root.display()));
        return Ok(1);
    }

    let schema_ok = print_schema(&catalog, &root);
    let report = catalog.dependency_report();
    print_dependencies(&report, &root);

    if schema_ok && !report.has_errors() {
        check_rendering(ctx, &catalog);
    }

    println!();
    if schema_ok && !report.has_errors() {
        ui::success("Catalog is valid");
        Ok(0)
    } else {
        ui::error("Catalog has errors");
        Ok(1)
    }
}

fn display(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .ok()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(path)
        .display()
        .to_string()
}

fn print_schema(catalog: &Catalog, root: &Path) -> bool {
    ui::header("Schema Validation");
    for file in &catalog.files {
        print_file(file, root);
    }

    let failed = catalog.invalid().count();
    println!();
    ui::kv("Total files", &catalog.files.len().to_string());
    ui::kv("Passed", &(catalog.files.len() - failed).to_string().green().to_string());
    ui::kv("Failed", &if failed > 0 {
        failed.to_string().red().to_string()
    } else {
        "0".to_string()
    });
    failed == 0
}

fn print_file(file: &FileReport, root: &Path) {
    let name = display(&file.path, root);
    if file.is_valid() {
        println!("  {} {name}", "✓".green());
        return;
    }
    println!("  {} {name}", "✗".red());
    for error in &file.errors {
        println!("      {}", error.red());
    }
}

fn print_dependencies(report: &DependencyReport, root: &Path) {
    ui::header("Dependency Validation");
    ui::kv("Operations loaded", &report.loaded.to_string());

    if !report.duplicates.is_empty() {
        ui::section("Duplicate operation ids");
        for (id, files) in &report.duplicates {
            let names: Vec<String> = files.iter().map(|f| display(f, root)).collect();
            println!("  {} {id}: {}", "✗".red(), names.join(", "));
        }
    }

    if !report.missing.is_empty() {
        ui::section("Missing dependencies");
        for missing in &report.missing {
            println!(
                "  {} {} requires '{}' ({})",
                "✗".red(),
                missing.operation,
                missing.missing,
                display(&missing.file, root).dimmed()
            );
        }
    }

    if !report.cycles.is_empty() {
        ui::section("Dependency cycles");
        for cycle in &report.cycles {
            let mut path = cycle.clone();
            if let Some(first) = cycle.first() {
                path.push(first.clone());
            }
            println!("  {} {}", "✗".red(), path.join(" -> "));
        }
    }

    let stats = &report.stats;
    ui::section("Statistics");
    ui::kv("Total operations", &stats.total_operations.to_string());
    ui::kv(
        "Operations with dependencies",
        &stats.operations_with_dependencies.to_string(),
    );
    ui::kv("Total dependencies", &stats.total_dependencies.to_string());
    if stats.total_operations > 0 {
        let average = stats.total_dependencies as f64 / stats.total_operations as f64;
        ui::kv("Average dependencies", &format!("{average:.2}"));
    }
    if let Some(most) = &stats.most_dependent {
        ui::kv(
            "Most dependencies",
            &format!("{most} ({})", stats.max_dependencies),
        );
    }
}

/// Placeholders the configured parameters do not cover are only a warning:
/// another config may supply them.
fn check_rendering(ctx: &Context, catalog: &Catalog) {
    let renderer = Renderer::new(ctx.config.parameters());
    match catalog.definitions(&renderer, DefinitionDefaults::default()) {
        Ok(_) => {}
        Err(CatalogError::Config(err)) => {
            println!();
            ui::warn(&format!("Not runnable with the current config: {err}"));
        }
        Err(err) => log::debug!("Rendering skipped: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures::{Workspace, bash_op};

    #[test]
    fn test_valid_catalog() {
        let ws = Workspace::new();
        ws.op("networking", "rg", &bash_op("rg", "networking", &[], "true"))
            .op("networking", "vnet", &bash_op("vnet", "networking", &["rg"], "true"));
        let ctx = ws.context();
        assert_eq!(run(&ctx, ValidateArgs { path: None }).unwrap(), 0);
    }

    #[test]
    fn test_schema_error_fails() {
        let ws = Workspace::new();
        ws.op("networking", "bad", "operation:\n  id: bad\n");
        let ctx = ws.context();
        assert_eq!(run(&ctx, ValidateArgs { path: None }).unwrap(), 1);
    }

    #[test]
    fn test_missing_dependency_fails() {
        let ws = Workspace::new();
        ws.op("networking", "vnet", &bash_op("vnet", "networking", &["ghost"], "true"));
        let ctx = ws.context();
        assert_eq!(run(&ctx, ValidateArgs { path: None }).unwrap(), 1);
    }

    #[test]
    fn test_single_file() {
        let ws = Workspace::new();
        ws.op("networking", "rg", &bash_op("rg", "networking", &[], "true"));
        let ctx = ws.context();
        let file = ws.catalog().join("networking/operations/rg.yaml");
        assert_eq!(run(&ctx, ValidateArgs { path: Some(file) }).unwrap(), 0);
    }

    #[test]
    fn test_empty_catalog_fails() {
        let ws = Workspace::new();
        let ctx = ws.context();
        assert_eq!(run(&ctx, ValidateArgs { path: None }).unwrap(), 1);
    }
}
