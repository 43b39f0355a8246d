use rhai::{ASTNode, Engine, Expr, Stmt, AST};
use thiserror::Error;

/// Bare call names that are never allowed in strategy code.
pub const BLOCKED_CALLS: &[&str] = &["exec", "eval", "open"];

/// Identifier deny-list applied to every property access and call site.
/// Strategy code arrives from a browser editor and is frequently pasted
/// from other runtimes; these names have no legitimate use in a signal
/// script.
pub const DENIED_IDENTIFIERS: &[&str] = &[
    "__class__",
    "__subclasses__",
    "__globals__",
    "__builtins__",
    "__getattribute__",
    "__getattr__",
    "__dict__",
    "__bases__",
    "__mro__",
    "__reduce__",
    "__reduce_ex__",
    "__subclasshook__",
];

#[derive(Debug, Error)]
pub enum VetError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("import statements are not allowed")]
    ImportStatement,

    #[error("call to '{0}' is not allowed")]
    BlockedCall(String),

    #[error("access to '{0}' is prohibited")]
    DeniedIdentifier(String),
}

/// Compile `source` and walk the whole syntax tree (function bodies
/// included) looking for forbidden constructs. Returns the compiled AST
/// so the runtime never evaluates anything the validator has not seen.
pub fn vet_source(engine: &Engine, source: &str) -> Result<AST, VetError> {
    let ast = engine
        .compile(source)
        .map_err(|e| VetError::Syntax(e.to_string()))?;
    vet_ast(&ast)?;
    Ok(ast)
}

fn vet_ast(ast: &AST) -> Result<(), VetError> {
    let mut violation: Option<VetError> = None;

    ast.walk(&mut |path: &[ASTNode]| {
        let Some(node) = path.last() else {
            return true;
        };
        match node {
            ASTNode::Stmt(Stmt::Import(..)) => {
                violation = Some(VetError::ImportStatement);
                false
            }
            ASTNode::Expr(Expr::FnCall(call, _)) | ASTNode::Expr(Expr::MethodCall(call, _)) => {
                let name = call.name.as_str();
                if BLOCKED_CALLS.contains(&name) {
                    violation = Some(VetError::BlockedCall(name.to_string()));
                    false
                } else if DENIED_IDENTIFIERS.contains(&name) {
                    violation = Some(VetError::DeniedIdentifier(name.to_string()));
                    false
                } else {
                    true
                }
            }
            ASTNode::Expr(Expr::Property(prop, _)) => {
                let name = prop.2.as_str();
                if DENIED_IDENTIFIERS.contains(&name) {
                    violation = Some(VetError::DeniedIdentifier(name.to_string()));
                    false
                } else {
                    true
                }
            }
            _ => true,
        }
    });

    match violation {
        Some(v) => Err(v),
        None => Ok(()),
    }
}
