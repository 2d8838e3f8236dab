// Step condition expressions. The language is a small set of status
// functions plus boolean combinators:
//
//   always(), succeeded(), succeededOrFailed(), failed(), canceled(),
//   true, false, and(...), or(...), not(x)
//
// An empty condition means succeeded().

use agent_common::TaskResult;
use agent_sdk::TraceWriter;

/// Job state a condition is evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionContext {
    /// The running job result at the time the step is considered.
    pub job_result: Option<TaskResult>,
    /// Whether the job has been canceled.
    pub job_canceled: bool,
}

/// A malformed condition expression. Per policy this fails the step.
#[derive(Debug, thiserror::Error)]
#[error("Unable to evaluate condition expression '{expression}': {reason}")]
pub struct ConditionError {
    pub expression: String,
    pub reason: String,
}

/// Evaluate a condition expression. Evaluation traces each function result
/// through `trace` so a host-only re-evaluation on cancellation is visible
/// in the diagnostic log without touching the user-facing one.
pub fn evaluate(
    expression: &str,
    state: &ConditionContext,
    trace: &dyn TraceWriter,
) -> Result<bool, ConditionError> {
    let expression = expression.trim();
    let effective = if expression.is_empty() {
        "succeeded()"
    } else {
        expression
    };

    let tokens = tokenize(effective).map_err(|reason| ConditionError {
        expression: expression.to_string(),
        reason,
    })?;

    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        state,
        trace,
    };
    let value = parser.parse_expression().map_err(|reason| ConditionError {
        expression: expression.to_string(),
        reason,
    })?;
    parser.expect_end().map_err(|reason| ConditionError {
        expression: expression.to_string(),
        reason,
    })?;

    trace.verbose(&format!("Condition '{effective}' evaluated to {value}."));
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    OpenParen,
    CloseParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(idx, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                tokens.push(Token::OpenParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::CloseParen);
                chars.next();
            }
            ',' => {
                tokens.push(Token::Comma);
                chars.next();
            }
            c if c.is_ascii_alphabetic() => {
                let mut end = idx;
                while let Some(&(j, c2)) = chars.peek() {
                    if c2.is_ascii_alphanumeric() {
                        end = j + c2.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(input[idx..end].to_string()));
            }
            other => {
                return Err(format!("Unexpected character '{other}' at position {idx}"));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    state: &'a ConditionContext,
    trace: &'a dyn TraceWriter,
}

impl<'a> Parser<'a> {
    fn parse_expression(&mut self) -> Result<bool, String> {
        let ident = match self.next() {
            Some(Token::Ident(name)) => name.clone(),
            other => return Err(format!("Expected a function or literal, found {other:?}")),
        };

        // Literals carry no argument list.
        match ident.to_lowercase().as_str() {
            "true" => return Ok(true),
            "false" => return Ok(false),
            _ => {}
        }

        self.expect(Token::OpenParen)
            .map_err(|_| format!("Expected '(' after '{ident}'"))?;

        let value = match ident.to_lowercase().as_str() {
            "always" => {
                self.expect(Token::CloseParen)?;
                true
            }
            "succeeded" => {
                self.expect(Token::CloseParen)?;
                !self.state.job_canceled
                    && matches!(
                        self.state.job_result,
                        None | Some(TaskResult::Succeeded) | Some(TaskResult::SucceededWithIssues)
                    )
            }
            "succeededorfailed" => {
                self.expect(Token::CloseParen)?;
                !self.state.job_canceled
                    && !matches!(self.state.job_result, Some(TaskResult::Canceled))
            }
            "failed" => {
                self.expect(Token::CloseParen)?;
                matches!(self.state.job_result, Some(TaskResult::Failed))
            }
            "canceled" => {
                self.expect(Token::CloseParen)?;
                self.state.job_canceled
                    || matches!(self.state.job_result, Some(TaskResult::Canceled))
            }
            "not" => {
                let inner = self.parse_expression()?;
                self.expect(Token::CloseParen)?;
                !inner
            }
            "and" => {
                let mut value = self.parse_expression()?;
                while self.consume_if(Token::Comma) {
                    // No short-circuit: arguments must still parse.
                    let next = self.parse_expression()?;
                    value = value && next;
                }
                self.expect(Token::CloseParen)?;
                value
            }
            "or" => {
                let mut value = self.parse_expression()?;
                while self.consume_if(Token::Comma) {
                    let next = self.parse_expression()?;
                    value = value || next;
                }
                self.expect(Token::CloseParen)?;
                value
            }
            other => {
                return Err(format!("Unknown function '{other}'"));
            }
        };

        self.trace
            .verbose(&format!("{ident} => {value}"));
        Ok(value)
    }

    fn expect_end(&mut self) -> Result<(), String> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(format!(
                "Unexpected trailing tokens starting at {:?}",
                self.tokens[self.pos]
            ))
        }
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if *token == expected => Ok(()),
            other => Err(format!("Expected {expected:?}, found {other:?}")),
        }
    }

    fn consume_if(&mut self, expected: Token) -> bool {
        if self.tokens.get(self.pos) == Some(&expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}
