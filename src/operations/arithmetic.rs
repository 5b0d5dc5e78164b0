use crate::error::{FleetError, Result};
use crate::operations::Operation;

fn operands(args: &[i64]) -> Result<(i64, i64)> {
    match args {
        [a, b] => Ok((*a, *b)),
        _ => Err(FleetError::Validation(format!(
            "expected 2 arguments, got {}",
            args.len()
        ))),
    }
}

fn overflow(op: &str, args: &[i64]) -> FleetError {
    FleetError::Execution(format!("{} overflowed for {:?}", op, args))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl Operation for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn description(&self) -> &'static str {
        "Adds two integers"
    }

    fn validate(&self, args: &[i64]) -> Result<()> {
        operands(args).map(|_| ())
    }

    fn execute(&self, args: &[i64]) -> Result<i64> {
        let (a, b) = operands(args)?;
        a.checked_add(b).ok_or_else(|| overflow(self.name(), args))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Subtract;

impl Operation for Subtract {
    fn name(&self) -> &'static str {
        "subtract"
    }

    fn description(&self) -> &'static str {
        "Subtracts the second integer from the first"
    }

    fn validate(&self, args: &[i64]) -> Result<()> {
        operands(args).map(|_| ())
    }

    fn execute(&self, args: &[i64]) -> Result<i64> {
        let (a, b) = operands(args)?;
        a.checked_sub(b).ok_or_else(|| overflow(self.name(), args))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Multiply;

impl Operation for Multiply {
    fn name(&self) -> &'static str {
        "multiply"
    }

    fn description(&self) -> &'static str {
        "Multiplies two integers"
    }

    fn validate(&self, args: &[i64]) -> Result<()> {
        operands(args).map(|_| ())
    }

    fn execute(&self, args: &[i64]) -> Result<i64> {
        let (a, b) = operands(args)?;
        a.checked_mul(b).ok_or_else(|| overflow(self.name(), args))
    }
}

/// Integer division, truncating toward zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct Divide;

impl Operation for Divide {
    fn name(&self) -> &'static str {
        "divide"
    }

    fn description(&self) -> &'static str {
        "Divides the first integer by the second"
    }

    fn validate(&self, args: &[i64]) -> Result<()> {
        let (_, divisor) = operands(args)?;
        if divisor == 0 {
            return Err(FleetError::Validation("division by zero".to_string()));
        }
        Ok(())
    }

    fn execute(&self, args: &[i64]) -> Result<i64> {
        let (a, b) = operands(args)?;
        if b == 0 {
            return Err(FleetError::Validation("division by zero".to_string()));
        }
        a.checked_div(b).ok_or_else(|| overflow(self.name(), args))
    }
}
