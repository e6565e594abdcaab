use crate::compile::token::{OperatorId, Scanner};
use crate::compile::types::DataValue;
use crate::error::CompileError;

/// Expression tree as parsed: operator nodes chain left-to-right exactly
/// as the source reads, with no precedence applied. `Paren` preserves the
/// original grouping for the evaluator's operator-stack barrier and for
/// constant folding. Precedence is resolved entirely by the evaluator.
#[derive(Clone, Debug, PartialEq)]
pub enum ExprNode {
    Const(DataValue),
    /// An identifier reference; a non-empty argument list is a subscript,
    /// a function reference, or a statement-function expansion, decided
    /// at evaluation time.
    Ref { name: String, args: Vec<ExprNode> },
    Unary { op: OperatorId, arg: Box<ExprNode> },
    Binary {
        op: OperatorId,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
    Paren(Box<ExprNode>),
}

/// Recursive-descent parse of one expression, consuming tokens up to the
/// first token that cannot continue it (a top-level comma, a closing
/// parenthesis that has no opener here, or end of statement).
pub fn parse_expression(s: &mut Scanner<'_>) -> Result<ExprNode, CompileError> {
    let mut left = parse_operand_chain(s)?;
    while let Some(op) = s.clone().take_operator(false) {
        if op == OperatorId::Not {
            return Err(CompileError::ExpressionSyntax(
                ".NOT. cannot follow an operand",
            ));
        }
        s.take_operator(false);
        let right = parse_operand_chain(s)?;
        left = ExprNode::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

/// One operand, with any leading unary operators applied. A leading `+`
/// or `-` is unary exactly because no left operand is pending here.
fn parse_operand_chain(s: &mut Scanner<'_>) -> Result<ExprNode, CompileError> {
    if let Some(op) = s.clone().take_operator(true) {
        if op.is_unary() {
            s.take_operator(true);
            let arg = parse_operand_chain(s)?;
            return Ok(ExprNode::Unary {
                op,
                arg: Box::new(arg),
            });
        }
        return Err(CompileError::ExpressionSyntax("operand expected"));
    }
    parse_operand(s)
}

fn parse_operand(s: &mut Scanner<'_>) -> Result<ExprNode, CompileError> {
    if let Some(b) = s.take_logical_constant() {
        return Ok(ExprNode::Const(DataValue::Log(b)));
    }
    if let Some(v) = s.take_number()? {
        return Ok(ExprNode::Const(v));
    }
    if let Some(text) = s.take_string()? {
        return Ok(ExprNode::Const(DataValue::Char(text)));
    }
    if s.eat(b'(') {
        let inner = parse_expression(s)?;
        if s.eat(b',') {
            // a parenthesised pair of constant reals is a complex constant
            let im = parse_expression(s)?;
            s.expect(b')', "closing parenthesis")?;
            return complex_constant(inner, im);
        }
        s.expect(b')', "closing parenthesis")?;
        return Ok(ExprNode::Paren(Box::new(inner)));
    }
    if let Some(name) = s.take_identifier() {
        let mut args = Vec::new();
        if s.eat(b'(') {
            if !s.eat(b')') {
                loop {
                    args.push(parse_expression(s)?);
                    if s.eat(b',') {
                        continue;
                    }
                    s.expect(b')', "closing parenthesis")?;
                    break;
                }
            }
        }
        return Ok(ExprNode::Ref { name, args });
    }
    match s.peek() {
        Some(b')') => Err(CompileError::ExpressionSyntax("unexpected `)`")),
        Some(b',') => Err(CompileError::ExpressionSyntax("unexpected `,`")),
        _ => Err(CompileError::ExpressionSyntax("operand expected")),
    }
}

fn complex_constant(re: ExprNode, im: ExprNode) -> Result<ExprNode, CompileError> {
    let part = |n: &ExprNode| -> Option<f64> {
        match n {
            ExprNode::Const(v) => v.as_f64(),
            ExprNode::Unary {
                op: OperatorId::Neg,
                arg,
            } => match arg.as_ref() {
                ExprNode::Const(v) => v.as_f64().map(|f| -f),
                _ => None,
            },
            ExprNode::Unary {
                op: OperatorId::Plus,
                arg,
            } => match arg.as_ref() {
                ExprNode::Const(v) => v.as_f64(),
                _ => None,
            },
            _ => None,
        }
    };
    match (part(&re), part(&im)) {
        (Some(r), Some(i)) => Ok(ExprNode::Const(DataValue::Complex(r, i))),
        _ => Err(CompileError::ExpressionSyntax(
            "complex constant parts must be constant",
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(text: &str) -> ExprNode {
        let mut s = Scanner::new(text);
        let node = parse_expression(&mut s).unwrap();
        assert!(s.at_end(), "unparsed input: {}", s.rest());
        node
    }

    #[test]
    fn operators_chain_left_without_precedence() {
        // 2+3*4 parses as ((2+3)*4) structurally; the evaluator's stacks
        // restore precedence
        let node = parse("2+3*4");
        match node {
            ExprNode::Binary { op, left, right } => {
                assert_eq!(op, OperatorId::Mul);
                assert_eq!(*right, ExprNode::Const(DataValue::Int(4)));
                match *left {
                    ExprNode::Binary { op, .. } => assert_eq!(op, OperatorId::Add),
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn leading_minus_is_unary() {
        let node = parse("-X+1");
        match node {
            ExprNode::Binary { op, left, .. } => {
                assert_eq!(op, OperatorId::Add);
                match *left {
                    ExprNode::Unary { op, .. } => assert_eq!(op, OperatorId::Neg),
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn minus_after_operator_is_unary() {
        let node = parse("A*-B");
        match node {
            ExprNode::Binary { op, right, .. } => {
                assert_eq!(op, OperatorId::Mul);
                assert!(matches!(
                    *right,
                    ExprNode::Unary {
                        op: OperatorId::Neg,
                        ..
                    }
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parenthesised_groups_become_sexpr_nodes() {
        let node = parse("(2+3)*4");
        match node {
            ExprNode::Binary { op, left, .. } => {
                assert_eq!(op, OperatorId::Mul);
                assert!(matches!(*left, ExprNode::Paren(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn subscripted_reference() {
        let node = parse("A(I,J+1)");
        match node {
            ExprNode::Ref { name, args } => {
                assert_eq!(name, "A");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn complex_constants() {
        assert_eq!(
            parse("(1.0,-2.0)"),
            ExprNode::Const(DataValue::Complex(1.0, -2.0))
        );
    }

    #[test]
    fn dot_operators_parse() {
        let node = parse("A.LT.B.AND.C");
        // as-parsed chain ends with the last operator
        match node {
            ExprNode::Binary { op, .. } => assert_eq!(op, OperatorId::And),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_operand_is_a_syntax_error() {
        let mut s = Scanner::new("2+");
        assert!(parse_expression(&mut s).is_err());
        let mut s = Scanner::new("(2+3");
        assert!(parse_expression(&mut s).is_err());
        let mut s = Scanner::new("*2");
        assert!(parse_expression(&mut s).is_err());
    }

    #[test]
    fn stops_at_top_level_comma() {
        let mut s = Scanner::new("X+1, Y");
        parse_expression(&mut s).unwrap();
        assert_eq!(s.peek(), Some(b','));
    }
}
