//! `key=value` kernel descriptor parsing.
//!
//! ```text
//! dir=fwd dt=bf16 mb=32 ih=56 iw=56 ic=256 one_pass=0 ic_block=64
//! ```
//!
//! Spatial extent is either `sp` or the product of `mb`, `id`, `ih` and `iw`.
//! Tunables (`atomics`, `ic_block`, `stat_sp_block`, `update_sp_block`,
//! `unroll`) given here are pinned.

use kernelplan_kernels::{
    DataType, Direction, ImplVariant, PlanError, Result, ShapeClass, WorkloadDescriptor,
};
use std::collections::BTreeMap;

/// Keys understood by [`parse_descriptor`].
pub const DESCRIPTOR_KEYS: [&str; 25] = [
    "dir",
    "impl",
    "dt",
    "sp",
    "mb",
    "id",
    "ih",
    "iw",
    "ic",
    "sg",
    "max_vect",
    "max_ic_block",
    "stats",
    "one_pass",
    "scale",
    "shift",
    "relu",
    "add_relu",
    "diff_stats",
    "deterministic",
    "atomics",
    "ic_block",
    "stat_sp_block",
    "update_sp_block",
    "unroll",
];

fn err(msg: impl Into<String>) -> PlanError {
    PlanError::Descriptor(msg.into())
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| err(format!("`{key}` expects an unsigned integer, got `{value}`")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(err(format!("`{key}` expects 0/1, got `{value}`"))),
    }
}

/// Split arguments on whitespace and commas into `key -> value`.
fn collect_pairs<S: AsRef<str>>(args: &[S]) -> Result<BTreeMap<String, String>> {
    let mut pairs = BTreeMap::new();
    for token in args
        .iter()
        .flat_map(|a| a.as_ref().split([',', ' ']).collect::<Vec<_>>())
        .filter(|t| !t.is_empty())
    {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| err(format!("`{token}` is not key=value")))?;
        let key = key.trim().to_ascii_lowercase();
        if !DESCRIPTOR_KEYS.contains(&key.as_str()) {
            return Err(err(format!("unknown key `{key}`")));
        }
        if pairs.insert(key.clone(), value.trim().to_string()).is_some() {
            return Err(err(format!("`{key}` given more than once")));
        }
    }
    Ok(pairs)
}

/// Build a validated workload from descriptor arguments.
pub fn parse_descriptor<S: AsRef<str>>(args: &[S]) -> Result<WorkloadDescriptor> {
    let pairs = collect_pairs(args)?;
    let get = |key: &str| pairs.get(key).map(String::as_str);

    let direction = match get("dir").unwrap_or("fwd") {
        "fwd" | "forward" | "fwd_d" | "fwd_i" => Direction::Forward,
        "bwd" | "backward" | "bwd_d" | "bwd_dw" => Direction::Backward,
        other => return Err(err(format!("unknown direction `{other}`"))),
    };
    let dtype = match get("dt").unwrap_or("f32") {
        "f32" => DataType::F32,
        "f16" => DataType::F16,
        "bf16" => DataType::BF16,
        other => return Err(err(format!("unsupported data type `{other}`"))),
    };

    let ic = parse_u64("ic", get("ic").ok_or_else(|| err("`ic` is required"))?)?;
    let dims = ["mb", "id", "ih", "iw"];
    let sp = match get("sp") {
        Some(v) if dims.iter().any(|d| pairs.contains_key(*d)) => {
            return Err(err(format!("`sp={v}` conflicts with mb/id/ih/iw")));
        }
        Some(v) => parse_u64("sp", v)?,
        None => {
            if !dims.iter().any(|d| pairs.contains_key(*d)) {
                return Err(err("spatial extent missing: give `sp` or mb/id/ih/iw"));
            }
            let mut sp = 1u64;
            for dim in dims {
                if let Some(v) = get(dim) {
                    sp = sp
                        .checked_mul(parse_u64(dim, v)?)
                        .ok_or_else(|| err("spatial extent overflows"))?;
                }
            }
            sp
        }
    };

    let mut shape = match direction {
        Direction::Forward => ShapeClass::forward(sp, ic, dtype),
        Direction::Backward => ShapeClass::backward(sp, ic, dtype),
    };
    if let Some(v) = get("impl") {
        shape.variant = match v {
            "opt" | "optimized" => ImplVariant::Optimized,
            "reusable" => ImplVariant::Reusable,
            other => return Err(err(format!("unknown implementation `{other}`"))),
        };
    }
    if let Some(v) = get("sg") {
        shape.sub_group_size = u32::try_from(parse_u64("sg", v)?)
            .map_err(|_| err("`sg` out of range"))?;
    }
    if let Some(v) = get("max_vect") {
        shape.max_vect_size = u32::try_from(parse_u64("max_vect", v)?)
            .map_err(|_| err("`max_vect` out of range"))?;
    }
    if let Some(v) = get("max_ic_block") {
        shape.max_ic_block = parse_u64("max_ic_block", v)?;
    }

    let flags = &mut shape.flags;
    for (key, slot) in [
        ("stats", &mut flags.calculate_stats),
        ("one_pass", &mut flags.use_stats_one_pass),
        ("scale", &mut flags.use_scale),
        ("shift", &mut flags.use_shift),
        ("relu", &mut flags.fuse_norm_relu),
        ("add_relu", &mut flags.fuse_norm_add_relu),
        ("diff_stats", &mut flags.calculate_diff_stats),
        ("deterministic", &mut flags.deterministic),
    ] {
        if let Some(v) = get(key) {
            *slot = parse_bool(key, v)?;
        }
    }

    let mut workload = WorkloadDescriptor::new(shape);
    if let Some(v) = get("atomics") {
        workload.use_fused_atomics_reduction.pin(parse_bool("atomics", v)?);
    }
    for (key, tunable) in [
        ("ic_block", &mut workload.ic_block),
        ("stat_sp_block", &mut workload.stat_sp_block),
        ("update_sp_block", &mut workload.update_sp_block),
        ("unroll", &mut workload.update_sp_unroll),
    ] {
        if let Some(v) = get(key) {
            tunable.pin(parse_u64(key, v)?);
        }
    }

    workload.validate()?;
    Ok(workload)
}
