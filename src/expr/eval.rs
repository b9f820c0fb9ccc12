use super::ExprError;
use super::parser::{Compiled, Expr, Operand};
use super::scope::EvalContext;
use super::value::{Value, compare, contains};

/// Evaluate a compiled expression against a context. Fails with a
/// `ScopeError`-kind error when a symbol is absent or two values cannot be
/// compared.
pub fn eval(compiled: &Compiled, ctx: &dyn EvalContext) -> Result<bool, ExprError> {
    eval_expr(&compiled.ast, ctx)
}

fn eval_expr(expr: &Expr, ctx: &dyn EvalContext) -> Result<bool, ExprError> {
    match expr {
        Expr::Or(a, b) => Ok(eval_expr(a, ctx)? || eval_expr(b, ctx)?),
        Expr::And(a, b) => Ok(eval_expr(a, ctx)? && eval_expr(b, ctx)?),
        Expr::Not(inner) => Ok(!eval_expr(inner, ctx)?),
        Expr::Cmp { op, lhs, rhs } => {
            let lhs = eval_operand(lhs, ctx)?;
            let rhs = eval_operand(rhs, ctx)?;
            compare(*op, &lhs, &rhs)
        }
        Expr::In { needle, haystack } => {
            let needle = eval_operand(needle, ctx)?;
            let haystack = eval_operand(haystack, ctx)?;
            contains(&needle, &haystack)
        }
        Expr::Truthy(operand) => Ok(eval_operand(operand, ctx)?.truthy()),
    }
}

fn eval_operand(operand: &Operand, ctx: &dyn EvalContext) -> Result<Value, ExprError> {
    match operand {
        Operand::Lit(value) => Ok(value.clone()),
        Operand::Var(path) => ctx.resolve(path),
    }
}
