use minijinja::Environment;
use serde::Serialize;

use crate::Result;

/// Fixed template identities for outbound mail.
pub const TEMPLATE_CREATED: &str = "created";
pub const TEMPLATE_DELETED: &str = "deleted";
pub const TEMPLATE_EXPIRING: &str = "expiring";

/// The mail template set, embedded at build time.
pub struct MailTemplates {
    env: Environment<'static>,
}

impl MailTemplates {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template(
            TEMPLATE_CREATED,
            include_str!("../templates/mail/created.html.j2"),
        )?;
        env.add_template(
            TEMPLATE_DELETED,
            include_str!("../templates/mail/deleted.html.j2"),
        )?;
        env.add_template(
            TEMPLATE_EXPIRING,
            include_str!("../templates/mail/expiring.html.j2"),
        )?;

        Ok(Self { env })
    }

    /// Render a named template with the given payload.
    pub fn render<S: Serialize>(&self, template: &str, payload: S) -> Result<String> {
        Ok(self.env.get_template(template)?.render(payload)?)
    }
}
