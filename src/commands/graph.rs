//! `capstan graph`

use crate::Context;
use crate::cli::GraphArgs;
use crate::ui;
use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use workflow::{DependencyEdge, EdgeSource, GraphStats, Plan};

#[derive(Debug, Serialize)]
struct GraphOutput<'a> {
    fingerprint: &'a str,
    order: &'a [String],
    edges: Vec<DependencyEdge>,
    stats: GraphStats,
}

pub fn run(ctx: &Context, args: GraphArgs) -> Result<u8> {
    let discovery = super::discovery(ctx);
    let plan = super::load_plan(ctx, discovery.as_ref(), None)?;

    if args.json {
        let output = GraphOutput {
            fingerprint: plan.fingerprint(),
            order: plan.order(),
            edges: plan.graph().edges().collect(),
            stats: plan.graph().stats(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(0);
    }

    print_order(&plan);
    Ok(0)
}

fn print_order(plan: &Plan) {
    ui::header("Execution Order");
    let edges: Vec<DependencyEdge> = plan.graph().edges().collect();
    let width = ui::column_width(plan.order().iter().map(String::as_str), 9);
    let number_width = plan.len().to_string().len();

    for (i, def) in plan.definitions().enumerate() {
        let requires: Vec<String> = edges
            .iter()
            .filter(|e| e.to == def.id)
            .map(|e| match e.source {
                EdgeSource::Declared => e.from.clone(),
                EdgeSource::Discovered => format!("{}*", e.from),
            })
            .collect();
        let after = if requires.is_empty() {
            String::new()
        } else {
            format!("after {}", requires.join(", "))
        };
        println!(
            "  {:>number_width$}. {:<width$}  {:<12}  {}",
            i + 1,
            def.id,
            def.capability.dimmed(),
            after.dimmed()
        );
    }

    let stats = plan.graph().stats();
    ui::section("Statistics");
    ui::kv("Operations", &stats.total_operations.to_string());
    ui::kv("Dependencies", &stats.total_dependencies.to_string());
    if stats.discovered_edges > 0 {
        ui::kv(
            "Discovered",
            &format!("{} (marked *)", stats.discovered_edges),
        );
    }
    if let Some(most) = &stats.most_dependent {
        ui::kv(
            "Most dependencies",
            &format!("{most} ({})", stats.max_dependencies),
        );
    }
    ui::kv("Fingerprint", plan.fingerprint());
}
