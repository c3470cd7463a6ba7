use beamforge::montecarlo::BatchReport;
use beamforge::optimizer::{SectionReport, SequenceReport};
use beamforge::scan::nested::{NestedPlan, NestedStep};
use beamforge::scan::ScanPoint;
use comfy_table::presets::ASCII_FULL;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(ASCII_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn metrics_text(metrics: &Option<Vec<f64>>) -> String {
    match metrics {
        Some(m) => m
            .iter()
            .map(|v| format!("{:.4e}", v))
            .collect::<Vec<_>>()
            .join(" / "),
        None => "n/a".to_string(),
    }
}

pub fn print_tuning_report(reports: &[SectionReport]) {
    let mut table = new_table();
    table.add_row(vec![
        Cell::new("Section").add_attribute(Attribute::Bold),
        Cell::new("Line"),
        Cell::new("Axis"),
        Cell::new("Original"),
        Cell::new("Found").fg(Color::Cyan),
        Cell::new("Metric"),
        Cell::new("Evals"),
        Cell::new("Stop"),
        Cell::new("Final").fg(Color::Green),
    ]);

    for i in 1..=6 {
        if let Some(col) = table.column_mut(i) {
            col.set_cell_alignment(CellAlignment::Right);
        }
    }

    for r in reports {
        for (n, a) in r.axes.iter().enumerate() {
            let final_cell = if n == 0 {
                metrics_text(&r.final_metrics)
            } else {
                String::new()
            };
            table.add_row(vec![
                Cell::new(r.section).add_attribute(Attribute::Bold),
                Cell::new(r.knob.line() + 1),
                Cell::new(a.axis),
                Cell::new(format!("{:.6}", a.original)),
                Cell::new(format!("{:.6}", a.value)).fg(Color::Cyan),
                Cell::new(a.metric.map_or("n/a".to_string(), |m| format!("{:.4e}", m))),
                Cell::new(a.evaluations),
                Cell::new(format!("{:?}", a.termination)),
                Cell::new(final_cell).fg(Color::Green),
            ]);
        }
    }
    println!("\n{}", table);
}

pub fn print_sequence_report(report: &SequenceReport) {
    print_tuning_report(&report.sections);
    println!(
        "🏁 Full-lattice metrics: {}",
        metrics_text(&report.final_metrics)
    );
}

pub fn print_batch_report(report: &BatchReport) {
    println!(
        "\n🎲 Batch {}: {}/{} trials completed (seed {})",
        report.run_id,
        report.completed(),
        report.trials.len(),
        report.base_seed
    );

    let mut table = new_table();
    table.add_row(vec![
        Cell::new("Column").add_attribute(Attribute::Bold),
        Cell::new("N"),
        Cell::new("Mean").fg(Color::Cyan),
        Cell::new("Std Dev").fg(Color::Red),
        Cell::new("Min"),
        Cell::new("Max"),
    ]);
    for i in 1..=5 {
        if let Some(col) = table.column_mut(i) {
            col.set_cell_alignment(CellAlignment::Right);
        }
    }
    for s in &report.stats {
        table.add_row(vec![
            Cell::new(&s.name).add_attribute(Attribute::Bold),
            Cell::new(s.count),
            Cell::new(format!("{:.6e}", s.mean)).fg(Color::Cyan),
            Cell::new(format!("{:.6e}", s.std_dev)).fg(Color::Red),
            Cell::new(format!("{:.6e}", s.min)),
            Cell::new(format!("{:.6e}", s.max)),
        ]);
    }
    println!("{}", table);

    println!("📄 Results: {:?}", report.results_path);
    if let Some(p) = &report.orbit_path {
        println!("📄 Orbit traces: {:?}", p);
    }
    if let Some(p) = &report.params_copy {
        println!("📄 Parameters: {:?}", p);
    }
}

pub fn print_scan_report(points: &[ScanPoint]) {
    let mut table = new_table();
    table.add_row(vec![
        Cell::new("#").add_attribute(Attribute::Bold),
        Cell::new("Value").fg(Color::Cyan),
        Cell::new("Output Row"),
    ]);
    for (i, p) in points.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i),
            Cell::new(p.value).set_alignment(CellAlignment::Right),
            Cell::new(p.row.as_deref().unwrap_or("(no table)")),
        ]);
    }
    println!("\n{}", table);
}

pub fn print_sweep_report(plan: &NestedPlan, steps: &[NestedStep]) {
    let mut table = new_table();
    let mut header: Vec<Cell> = plan
        .outer
        .iter()
        .map(|n| Cell::new(n).add_attribute(Attribute::Bold))
        .collect();
    header.push(Cell::new(format!("Best {}", plan.inner)).fg(Color::Cyan));
    header.push(Cell::new(format!("Min {}", plan.column)).fg(Color::Green));
    header.push(Cell::new("Runs"));
    table.add_row(header);
    for step in steps {
        let mut row: Vec<Cell> = step
            .outer
            .iter()
            .map(|v| Cell::new(v).set_alignment(CellAlignment::Right))
            .collect();
        match step.best {
            Some((value, metric)) => {
                row.push(Cell::new(value).set_alignment(CellAlignment::Right));
                row.push(Cell::new(format!("{:.4e}", metric)));
            }
            None => {
                row.push(Cell::new("n/a"));
                row.push(Cell::new("(no table)"));
            }
        }
        row.push(Cell::new(step.runs));
        table.add_row(row);
    }
    println!("\n{}", table);
}
