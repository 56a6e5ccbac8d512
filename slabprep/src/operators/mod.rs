//! External operators: the opaque toolbox and the registration seam.

mod command;
mod registration;
mod toolbox;

pub use command::{render_template, CommandRegistration, CommandToolbox, TemplateBindings};
#[cfg(test)]
pub use registration::MockRegistrationOperator;
pub use registration::{RegistrationOperator, RegistrationOutput, RegistrationRequest, REGISTRATION_OPERATOR};
pub use toolbox::{ExternalOp, ExternalToolbox, OperatorDefinition, OperatorInvocation};
