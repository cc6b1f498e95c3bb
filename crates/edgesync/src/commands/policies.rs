//! Policy document command handlers.

use tabled::Tabled;

use edgesync_core::PolicyDocument;

use crate::cli::{GlobalOpts, PoliciesArgs, PoliciesCommand};
use crate::error::CliError;
use crate::fleet::Fleet;
use crate::output;

use super::util;

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct PolicyRow {
    #[tabled(rename = "Kind")]
    kind: &'static str,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Org")]
    org: String,
    #[tabled(rename = "Name / Revision")]
    label: String,
}

impl From<&PolicyDocument> for PolicyRow {
    fn from(doc: &PolicyDocument) -> Self {
        let (id, org, label) = match doc {
            PolicyDocument::QosPolicy(p) => (p.id.to_string(), &p.org, p.name.clone()),
            PolicyDocument::FirewallPolicy(p) => (p.id.to_string(), &p.org, p.name.clone()),
            PolicyDocument::VrrpGroup(g) => (g.id.to_string(), &g.org, g.name.clone()),
            PolicyDocument::TrafficMap(m) => {
                (m.org.to_string(), &m.org, format!("rev {}", m.revision))
            }
            PolicyDocument::AppIdentification(a) => {
                (a.org.to_string(), &a.org, format!("rev {}", a.revision))
            }
            PolicyDocument::Notifications(n) => {
                (n.org.to_string(), &n.org, format!("rev {}", n.revision))
            }
        };
        Self {
            kind: kind(doc),
            id,
            org: org.to_string(),
            label,
        }
    }
}

fn kind(doc: &PolicyDocument) -> &'static str {
    match doc {
        PolicyDocument::QosPolicy(_) => "qosPolicy",
        PolicyDocument::TrafficMap(_) => "trafficMap",
        PolicyDocument::AppIdentification(_) => "appIdentification",
        PolicyDocument::FirewallPolicy(_) => "firewallPolicy",
        PolicyDocument::VrrpGroup(_) => "vrrpGroup",
        PolicyDocument::Notifications(_) => "notifications",
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(
    fleet: &Fleet,
    args: PoliciesArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match args.command {
        PoliciesCommand::List => {
            let docs = fleet.store.policies();
            let out = output::render_list(
                &global.output,
                &docs,
                |d| PolicyRow::from(d),
                |d| format!("{}/{}", kind(d), PolicyRow::from(d).id),
            );
            output::print_output(&out, global.quiet);
            Ok(())
        }

        PoliciesCommand::Import { file } => {
            let docs: Vec<PolicyDocument> = util::read_documents(&file)?;
            let count = docs.len();
            for doc in docs {
                tracing::debug!(kind = kind(&doc), "importing policy document");
                fleet.store.put_policy(doc);
            }
            if !global.quiet {
                eprintln!("Imported {count} policy document(s)");
            }
            Ok(())
        }
    }
}
