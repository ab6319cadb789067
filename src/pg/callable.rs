//! Procedure calls with output parameters.
//!
//! Callers address logical positions, including the `{? = call ...}`
//! return slot, while the statement sent to the server only has input
//! placeholders. [`ParameterMapper`] translates between the two and
//! rewrites the SQL so output-only positions disappear from it.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::debug;

use super::coerce::{FromValue, ToValue};
use super::error::{PgError, PgResult};
use super::escapes::apply_escapes;
use super::portal::ResultBatch;
use super::session::{Session, Transport};
use super::types::PgValue;

/// Comma cleanup after placeholders were removed, applied in order.
static COMMA_CLEANUP: Lazy<Result<Vec<(Regex, &'static str)>, regex::Error>> = Lazy::new(|| {
    [(r"\(\s*,+", "("), (r",\s*,", ","), (r",+\s*\)", ")")]
        .into_iter()
        .map(|(pattern, replacement)| Regex::new(pattern).map(|re| (re, replacement)))
        .collect()
});

/// Placeholder patterns by parameter number.
static PLACEHOLDERS: Lazy<Mutex<HashMap<usize, Arc<Regex>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn placeholder(index: usize) -> PgResult<Arc<Regex>> {
    let mut patterns = PLACEHOLDERS.lock();
    if let Some(pattern) = patterns.get(&index) {
        return Ok(Arc::clone(pattern));
    }
    let pattern = Regex::new(&format!(r"\s*\$({})\s*([,)])", index))
        .map_err(|e| PgError::Structural(format!("Invalid placeholder pattern: {}", e)))?;
    let pattern = Arc::new(pattern);
    patterns.insert(index, Arc::clone(&pattern));
    Ok(pattern)
}

/// How a logical position takes part in a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterMode {
    In,
    Out,
    InOut,
    /// Function result of `{? = call ...}`
    Assign,
}

impl ParameterMode {
    fn is_input(mode: Option<ParameterMode>) -> bool {
        matches!(mode, Some(ParameterMode::In) | Some(ParameterMode::InOut))
    }

    fn is_output(mode: Option<ParameterMode>) -> bool {
        matches!(
            mode,
            Some(ParameterMode::Out) | Some(ParameterMode::InOut) | Some(ParameterMode::Assign)
        )
    }
}

/// Modes of every logical position of a call, 1-based.
///
/// Modes only move forward: unset becomes In or Out, and In or Out
/// becomes InOut once the position is both bound and registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterMapper {
    modes: Vec<Option<ParameterMode>>,
    has_assign: bool,
}

impl ParameterMapper {
    /// `placeholders` counts the statement's `$n`; the return slot of an
    /// assign call comes on top as position 1.
    pub fn new(placeholders: usize, has_assign: bool) -> Self {
        let mut modes = vec![None; placeholders];
        if has_assign {
            modes.insert(0, Some(ParameterMode::Assign));
        }
        Self { modes, has_assign }
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn mode(&self, position: usize) -> Option<ParameterMode> {
        self.check(position).ok().and_then(|_| self.modes[position - 1])
    }

    fn check(&self, position: usize) -> PgResult<()> {
        if position == 0 || position > self.modes.len() {
            return Err(PgError::Structural(format!(
                "Parameter index {} out of range (1..{})",
                position,
                self.modes.len()
            )));
        }
        Ok(())
    }

    /// Mark `position` as bound; returns its input index.
    pub fn set(&mut self, position: usize) -> PgResult<usize> {
        self.check(position)?;
        let slot = &mut self.modes[position - 1];
        *slot = match *slot {
            None => Some(ParameterMode::In),
            Some(ParameterMode::Out) => Some(ParameterMode::InOut),
            Some(ParameterMode::Assign) => {
                return Err(PgError::Structural(
                    "The function result cannot be bound".to_string(),
                ))
            }
            mode => mode,
        };
        self.map_to_input_index(position)
    }

    /// Mark `position` as an output; returns its output index.
    pub fn register_out(&mut self, position: usize) -> PgResult<usize> {
        self.check(position)?;
        let slot = &mut self.modes[position - 1];
        *slot = match *slot {
            None => Some(ParameterMode::Out),
            Some(ParameterMode::In) => Some(ParameterMode::InOut),
            mode => mode,
        };
        self.map_to_output_index(position)
    }

    /// Index among the values bound to the server statement.
    pub fn map_to_input_index(&self, position: usize) -> PgResult<usize> {
        self.check(position)?;
        if matches!(
            self.modes[position - 1],
            Some(ParameterMode::Out) | Some(ParameterMode::Assign)
        ) {
            return Err(PgError::Structural(format!(
                "Parameter {} is not an input",
                position
            )));
        }
        let skipped = self.modes[..position - 1]
            .iter()
            .filter(|m| matches!(m, Some(ParameterMode::Out) | Some(ParameterMode::Assign)))
            .count();
        Ok(position - skipped)
    }

    /// Column index in the returned output row.
    pub fn map_to_output_index(&self, position: usize) -> PgResult<usize> {
        self.check(position)?;
        if !ParameterMode::is_output(self.modes[position - 1]) {
            return Err(PgError::Structural(format!(
                "Parameter {} was not registered as an output",
                position
            )));
        }
        let skipped = self.modes[..position - 1]
            .iter()
            .filter(|m| !ParameterMode::is_output(**m))
            .count();
        Ok(position - skipped)
    }

    pub fn input_count(&self) -> usize {
        self.modes.iter().filter(|m| ParameterMode::is_input(**m)).count()
    }

    pub fn output_count(&self) -> usize {
        self.modes.iter().filter(|m| ParameterMode::is_output(**m)).count()
    }

    /// Logical positions that still have no mode.
    pub fn unset(&self) -> Vec<usize> {
        self.modes
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_none())
            .map(|(i, _)| i + 1)
            .collect()
    }

    /// SQL for the server: output-only placeholders are removed, the rest
    /// renumbered densely, then stray commas are collapsed.
    pub fn rewrite_for_execution(&self, sql: &str) -> PgResult<String> {
        let mut sql = sql.to_string();
        let mut next = 1;
        let offset = usize::from(self.has_assign);
        for (i, mode) in self.modes.iter().enumerate().skip(offset) {
            let pattern = placeholder(i + 1 - offset)?;
            sql = if *mode == Some(ParameterMode::Out) {
                pattern.replace(&sql, "${2}").into_owned()
            } else {
                let replacement = format!("$${}${{2}}", next);
                next += 1;
                pattern.replace(&sql, replacement.as_str()).into_owned()
            };
        }

        let passes = COMMA_CLEANUP
            .as_ref()
            .map_err(|e| PgError::Structural(format!("Invalid cleanup pattern: {}", e)))?;
        for (pattern, replacement) in passes {
            sql = pattern.replace_all(&sql, *replacement).into_owned();
        }
        Ok(sql)
    }

    /// Output values from the batch a call returned: exactly one batch
    /// with one row holding one column per output position.
    pub fn extract_outputs(&self, batches: &[ResultBatch]) -> PgResult<Vec<(String, PgValue)>> {
        let expected = self.output_count();
        let [batch] = batches else {
            return Err(PgError::Structural(format!(
                "Output parameters need exactly one result batch, got {}",
                batches.len()
            )));
        };
        if batch.rows.len() != 1 {
            return Err(PgError::Structural(format!(
                "Output parameters need exactly one row, got {}",
                batch.rows.len()
            )));
        }
        if batch.columns.len() != expected {
            return Err(PgError::Structural(format!(
                "Incorrect number of output parameters: expected {}, got {}",
                expected,
                batch.columns.len()
            )));
        }
        let row = &batch.rows[0];
        Ok(batch
            .columns
            .iter()
            .zip(row.values())
            .map(|(column, value)| (column.name.clone(), value.clone()))
            .collect())
    }
}

/// A prepared procedure call.
#[derive(Debug, Clone)]
pub struct CallableStatement {
    /// Escape-processed SQL with one placeholder per input-capable position
    sql: String,
    mapper: ParameterMapper,
    /// Values by logical position
    values: Vec<Option<PgValue>>,
    outputs: Vec<(String, PgValue)>,
    executed: bool,
}

impl CallableStatement {
    /// Parse `sql`, usually `{call proc(?, ?)}` or `{? = call fn(?)}`.
    pub fn parse(sql: &str) -> PgResult<Self> {
        let mut text = super::sql_text::SqlText::parse(sql)?;
        let has_assign = apply_escapes(&mut text)?;
        let mapper = ParameterMapper::new(text.count_parameters(), has_assign);
        Ok(Self {
            sql: text.render(),
            values: vec![None; mapper.len()],
            mapper,
            outputs: Vec::new(),
            executed: false,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn mapper(&self) -> &ParameterMapper {
        &self.mapper
    }

    /// Bind a value to a logical position.
    pub fn set<T: ToValue>(&mut self, position: usize, value: T) -> PgResult<()> {
        self.mapper.set(position)?;
        self.values[position - 1] = Some(value.to_value());
        Ok(())
    }

    pub fn register_out(&mut self, position: usize) -> PgResult<()> {
        self.mapper.register_out(position).map(|_| ())
    }

    /// Input values in server order; every input position must be bound.
    fn inputs(&self) -> PgResult<Vec<PgValue>> {
        let mut inputs = Vec::with_capacity(self.mapper.input_count());
        for position in 1..=self.mapper.len() {
            match self.mapper.mode(position) {
                Some(ParameterMode::In) | Some(ParameterMode::InOut) => {
                    let value = self.values[position - 1].clone().ok_or_else(|| {
                        PgError::Structural(format!("Parameter {} is not set", position))
                    })?;
                    inputs.push(value);
                }
                Some(ParameterMode::Out) | Some(ParameterMode::Assign) => {}
                None => {
                    return Err(PgError::Structural(format!(
                        "Parameter {} is neither set nor registered",
                        position
                    )))
                }
            }
        }
        Ok(inputs)
    }

    /// Output value of a logical position after execution.
    pub fn get<T: FromValue>(&self, position: usize) -> PgResult<T> {
        if !self.executed {
            return Err(PgError::Structural("Statement not executed".to_string()));
        }
        let index = self.mapper.map_to_output_index(position)?;
        let (_, value) = self.outputs.get(index - 1).ok_or_else(|| {
            PgError::Structural(format!("Output parameter {} was not returned", position))
        })?;
        T::from_value(value)
    }

    /// Output value by the column name the server gave it.
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> PgResult<T> {
        let (_, value) = self
            .outputs
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| PgError::Structural(format!("No output parameter named {}", name)))?;
        T::from_value(value)
    }
}

impl<S: Transport> Session<S> {
    pub fn prepare_call(&self, sql: &str) -> PgResult<CallableStatement> {
        self.ensure_open()?;
        CallableStatement::parse(sql)
    }

    /// Run a procedure call, capturing its output parameters.
    pub async fn execute_call(&mut self, call: &mut CallableStatement) -> PgResult<ResultBatch> {
        let sql = call.mapper.rewrite_for_execution(&call.sql)?;
        let inputs = call.inputs()?;
        debug!(sql = %sql, inputs = inputs.len(), outputs = call.mapper.output_count(), "call");

        let batch = self.query(&sql, &inputs).await?;
        if call.mapper.output_count() > 0 {
            call.outputs = call.mapper.extract_outputs(std::slice::from_ref(&batch))?;
        }
        call.executed = true;
        Ok(batch)
    }
}
