//! Admission check that turns away figures likely to stall the chart engine.
//!
//! The capacities below are observed engine limits, one per trace type. They
//! are not derived from a formula and must not be "simplified".

use crate::request::{ExportSpec, Figure};
use serde_json::{Map, Value};

pub const MAX_TRACES: usize = 200;

/// True when the figure should be rejected before it reaches the renderer.
pub fn is_likely_to_hang(spec: &ExportSpec) -> bool {
    spec.figure().is_some_and(figure_is_likely_to_hang)
}

pub fn figure_is_likely_to_hang(figure: &Figure) -> bool {
    if figure.data.len() > MAX_TRACES {
        return true;
    }

    let mut budget = 0.0;
    for trace in &figure.data {
        budget += trace_cost(trace);
        if budget > 1.0 {
            return true;
        }
    }
    false
}

/// Sum of per-trace costs, where 1.0 is the whole budget.
pub fn estimate_budget(figure: &Figure) -> f64 {
    figure.data.iter().map(trace_cost).sum()
}

fn trace_cost(trace: &Value) -> f64 {
    let empty = Map::new();
    let trace = trace.as_object().unwrap_or(&empty);
    estimated_points(trace) as f64 / per_trace_capacity(trace)
}

/// Longest array-valued field as a proxy for the number of drawn points.
/// Two-dimensional arrays count every cell.
fn max_array_length(container: &Map<String, Value>) -> usize {
    container
        .values()
        .filter_map(Value::as_array)
        .map(|array| match array.first() {
            Some(Value::Array(_)) => array
                .iter()
                .map(|row| row.as_array().map_or(0, Vec::len))
                .sum(),
            _ => array.len(),
        })
        .max()
        .unwrap_or(0)
}

pub fn estimated_points(trace: &Map<String, Value>) -> usize {
    let top_level = max_array_length(trace);

    // parcoords / splom
    let dimension_level = trace
        .get("dimensions")
        .and_then(Value::as_array)
        .map(|dimensions| {
            dimensions
                .iter()
                .filter_map(Value::as_object)
                .map(max_array_length)
                .sum()
        })
        .unwrap_or(0);

    // table
    let cell_level = trace
        .get("cells")
        .and_then(Value::as_object)
        .map(max_array_length)
        .unwrap_or(0);

    top_level.max(dimension_level).max(cell_level)
}

pub fn per_trace_capacity(trace: &Map<String, Value>) -> f64 {
    let trace_type = trace
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("scatter");

    match trace_type {
        "scattergl" | "splom" | "pointcloud" | "table" => 1e7,
        "scatterpolargl" | "heatmap" | "heatmapgl" => 1e6,
        "scatter3d" | "surface" => 5e5,
        "mesh3d" => {
            if alphahull(trace).is_some_and(|hull| hull >= 0.0) {
                1000.0
            } else {
                5e5
            }
        }
        "parcoords" => 5e5,
        "scattermapbox" => 5e5,
        "histogram" | "histogram2d" | "histogram2dcontour" => 1e6,
        "box" => {
            if trace.get("boxpoints").and_then(Value::as_str) == Some("all") {
                5e4
            } else {
                1e6
            }
        }
        "violin" => {
            if trace.get("points").and_then(Value::as_str) == Some("all") {
                5e4
            } else {
                1e6
            }
        }
        _ => 5e4,
    }
}

fn alphahull(trace: &Map<String, Value>) -> Option<f64> {
    match trace.get("alphahull")? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) if text.trim().is_empty() => Some(0.0),
        Value::String(text) => text.trim().parse().ok(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn figure(data: Vec<Value>) -> Figure {
        Figure {
            data,
            layout: Map::new(),
        }
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn points(n: usize) -> Value {
        Value::Array(vec![json!(0); n])
    }

    #[test]
    fn trace_count_ceiling_rejects_regardless_of_size() {
        let traces = (0..250).map(|_| json!({"y": [1]})).collect();
        assert!(figure_is_likely_to_hang(&figure(traces)));
        let traces = (0..200).map(|_| json!({})).collect();
        assert!(!figure_is_likely_to_hang(&figure(traces)));
    }

    #[test]
    fn large_scattergl_trace_is_admitted() {
        let trace = json!({"type": "scattergl", "x": points(2_000_000)});
        let fig = figure(vec![trace]);
        assert!(!figure_is_likely_to_hang(&fig));
        assert!((estimate_budget(&fig) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn default_scatter_budget_is_fifty_thousand_points() {
        assert!(!figure_is_likely_to_hang(&figure(vec![json!({"y": points(50_000)})])));
        assert!(figure_is_likely_to_hang(&figure(vec![json!({"y": points(50_001)})])));
    }

    #[test]
    fn budget_accumulates_across_traces() {
        let trace = json!({"type": "heatmap", "z": points(400_000)});
        assert!(!figure_is_likely_to_hang(&figure(vec![trace.clone(), trace.clone()])));
        assert!(figure_is_likely_to_hang(&figure(vec![trace.clone(), trace.clone(), trace])));
    }

    #[test]
    fn two_dimensional_arrays_count_cells() {
        let trace = obj(json!({"type": "heatmap", "z": [[1, 2, 3], [4, 5, 6]], "x": [1, 2]}));
        assert_eq!(estimated_points(&trace), 6);
    }

    #[test]
    fn dimensions_are_summed() {
        let trace = obj(json!({
            "type": "parcoords",
            "dimensions": [{"values": [1, 2, 3]}, {"values": [1, 2]}, {"label": "x"}]
        }));
        assert_eq!(estimated_points(&trace), 5);
    }

    #[test]
    fn table_cells_are_measured() {
        let trace = obj(json!({
            "type": "table",
            "header": {"values": ["a"]},
            "cells": {"values": [[1, 2, 3, 4]]}
        }));
        assert_eq!(estimated_points(&trace), 4);
    }

    #[test]
    fn capacity_table_is_type_aware() {
        let cap = |trace: Value| per_trace_capacity(&obj(trace));
        assert_eq!(cap(json!({})), 5e4);
        assert_eq!(cap(json!({"type": "splom"})), 1e7);
        assert_eq!(cap(json!({"type": "histogram2dcontour"})), 1e6);
        assert_eq!(cap(json!({"type": "scattermapbox"})), 5e5);
        assert_eq!(cap(json!({"type": "mesh3d"})), 5e5);
        assert_eq!(cap(json!({"type": "mesh3d", "alphahull": 0})), 1000.0);
        assert_eq!(cap(json!({"type": "mesh3d", "alphahull": -1})), 5e5);
        assert_eq!(cap(json!({"type": "mesh3d", "alphahull": ""})), 1000.0);
        assert_eq!(cap(json!({"type": "mesh3d", "alphahull": " 2 "})), 1000.0);
        assert_eq!(cap(json!({"type": "mesh3d", "alphahull": "x"})), 5e5);
        assert_eq!(cap(json!({"type": "box"})), 1e6);
        assert_eq!(cap(json!({"type": "box", "boxpoints": "all"})), 5e4);
        assert_eq!(cap(json!({"type": "violin", "points": "all"})), 5e4);
        assert_eq!(cap(json!({"type": "sunburst"})), 5e4);
    }

    #[test]
    fn null_traces_cost_nothing() {
        let fig = figure(vec![Value::Null, json!(3)]);
        assert_eq!(estimate_budget(&fig), 0.0);
        assert!(!figure_is_likely_to_hang(&fig));
    }

    #[test]
    fn adding_traces_never_lowers_the_budget() {
        let mut traces = vec![json!({"y": points(30_000)})];
        let mut previous = estimate_budget(&figure(traces.clone()));
        for extra in [json!({"type": "bar", "y": points(10)}), json!({"type": "table"}), json!(null)] {
            traces.push(extra);
            let current = estimate_budget(&figure(traces.clone()));
            assert!(current >= previous);
            previous = current;
        }

        let mut over = vec![json!({"y": points(60_000)})];
        assert!(figure_is_likely_to_hang(&figure(over.clone())));
        over.push(json!({"y": points(5)}));
        assert!(figure_is_likely_to_hang(&figure(over)));
    }
}
