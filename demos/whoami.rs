//! # Demo: the low-level API
//!
//! Builds the action list by hand, spawns `id` in a new user namespace with root mapped to the
//! caller's own uid and gid, and reads the child's error channel directly. Run with a bad
//! program path to see a setup failure reported:
//!
//! ```text
//! cargo run --example whoami -- /no/such/program
//! ```

use palisade::spawn::{spawn, SpawnRequest};
use palisade::{error_channel, Action, Exec, MapIdentity, Namespace, NamespaceSet};
use tracing::{error, info};
mod common;

pub fn main() -> eyre::Result<()> {
    common::configure_logging();

    let program = std::env::args().nth(1).unwrap_or_else(|| "/usr/bin/id".into());

    let actions: Vec<Action> = vec![
        MapIdentity::current().into(),
        Exec::from_strs(&program, [program.as_str()], ["PATH=/usr/bin:/bin"])?.into(),
    ];

    let (reader, writer) = error_channel()?;
    let child = spawn(SpawnRequest {
        namespaces: NamespaceSet::default().with(Namespace::User),
        actions: &actions,
        errors: &writer,
        forward_logs: true,
    })?;
    drop(writer);

    if let Some(report) = reader.read_report()? {
        error!(%report, "child setup failed");
    }

    let exit = child.wait()?;
    info!(?exit);
    Ok(())
}
