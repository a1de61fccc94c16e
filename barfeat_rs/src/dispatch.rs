//! Evaluates a feature request against a bar table.
//!
//! Every clause is parsed, looked up and has its arguments resolved before
//! any indicator runs, so a bad clause anywhere in the request fails it
//! without producing partial output.

use tracing::{debug, info};

use crate::data::{BarSchema, BarTable};
use crate::error::{FeatureError, FeatureResult};
use crate::expr::{FeatureCall, parse_feature_expr};
use crate::indicators::BandSelector;
use crate::registry::{
    ArgKind, ArgValue, IndicatorArgs, IndicatorSpec, find_indicator, indicator_names,
};
use crate::table::FeatureTable;

struct PlannedCall<'a> {
    call: &'a FeatureCall,
    label: String,
    spec: &'static IndicatorSpec,
    args: IndicatorArgs<'a>,
}

/// Parse `expr` and compute one column per clause, in request order.
pub fn compute_features(bars: &BarTable, expr: &str) -> FeatureResult<FeatureTable> {
    let calls = parse_feature_expr(expr)?;
    compute_calls(bars, &calls)
}

pub fn compute_calls(bars: &BarTable, calls: &[FeatureCall]) -> FeatureResult<FeatureTable> {
    let planned = calls
        .iter()
        .map(|call| plan_call(bars, call))
        .collect::<FeatureResult<Vec<_>>>()?;

    let mut table = FeatureTable::new(bars.timestamps().to_vec());
    for step in &planned {
        let values = step
            .spec
            .compute(&step.args)
            .map_err(|err| err.in_call(&step.label))?;
        table
            .push_column(step.call.column_name(), values)
            .map_err(|err| err.in_call(&step.label))?;
        debug!(feature = %step.label, "Computed feature column");
    }

    info!(
        features = table.width(),
        rows = table.len(),
        "Computed feature table"
    );
    Ok(table)
}

/// Single-schema bars carry one running price in `value`. It stands in for
/// `open`, and `close` is read as `open`.
pub fn resolve_column_name(schema: BarSchema, name: &str) -> &str {
    match (schema, name) {
        (BarSchema::Single, "open" | "close") => "value",
        _ => name,
    }
}

fn plan_call<'a>(bars: &'a BarTable, call: &'a FeatureCall) -> FeatureResult<PlannedCall<'a>> {
    let label = call.to_string();
    let spec = find_indicator(&call.name).ok_or_else(|| FeatureError::UnknownIndicator {
        name: call.name.clone(),
        call: label.clone(),
        supported: indicator_names().join(", "),
    })?;

    if call.args.len() != spec.arity() {
        return Err(FeatureError::invalid(
            &label,
            format!(
                "{} takes {} arguments ({}), got {}",
                spec.name,
                spec.arity(),
                spec.usage,
                call.args.len()
            ),
        ));
    }

    let values = spec
        .args
        .iter()
        .zip(&call.args)
        .enumerate()
        .map(|(idx, (kind, raw))| {
            resolve_arg(bars, *kind, raw).map_err(|reason| {
                FeatureError::invalid(&label, format!("argument {} '{raw}': {reason}", idx + 1))
            })
        })
        .collect::<FeatureResult<Vec<_>>>()?;

    Ok(PlannedCall {
        call,
        label,
        spec,
        args: IndicatorArgs::new(values),
    })
}

fn resolve_arg<'a>(bars: &'a BarTable, kind: ArgKind, raw: &str) -> Result<ArgValue<'a>, String> {
    match kind {
        ArgKind::Period => match raw.parse::<usize>() {
            Ok(0) => Err("period must be at least 1".to_string()),
            Ok(period) => Ok(ArgValue::Period(period)),
            Err(_) => Err("expected a positive integer period".to_string()),
        },
        ArgKind::Float => raw
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(ArgValue::Float)
            .ok_or_else(|| "expected a finite number".to_string()),
        ArgKind::Band => {
            let code = raw
                .parse::<i64>()
                .map_err(|_| "expected an integer band selector".to_string())?;
            BandSelector::try_from(code)
                .map(ArgValue::Band)
                .map_err(|err| match err {
                    FeatureError::InvalidArgument { reason, .. } => reason,
                    other => other.to_string(),
                })
        }
        ArgKind::Column => {
            let name = resolve_column_name(bars.schema(), raw);
            bars.column(name).map(ArgValue::Column).ok_or_else(|| {
                format!(
                    "unknown column (available: {})",
                    bars.column_names().join(", ")
                )
            })
        }
    }
}
