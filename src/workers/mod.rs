//! Queue workers
//!
//! One handler per queue. Handlers return explicit retryable or fatal
//! outcomes and never decide retry policy themselves.

mod automation;
mod campaign;
mod message;
mod recovery;

use std::collections::HashMap;

pub use automation::AutomationWorker;
pub use campaign::CampaignWorker;
pub use message::MessageWorker;
pub use recovery::RecoveryWorker;

/// Fill `{{key}}` placeholders from a variable map. Unknown placeholders
/// are left in place so a bad template is visible, not silently blank.
#[must_use]
pub fn render_template(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = template.to_owned();
    for (key, value) in variables {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}
