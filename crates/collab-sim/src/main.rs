//! collab-sim: drives several in-process peers through random concurrent
//! edits and connectivity churn, then checks that every peer converged.

use anyhow::{Context, Result, bail};
use clap::Parser;
use collab_core::text::char_to_utf16;
use collab_core::{
    CollabConfig, CollabSession, LocalDocument, LoopbackHub, LoopbackProvider, NodeKey, NodeKind,
    NodeSpec, PeerId, Point, Selection, Snapshot,
};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

type Session = CollabSession<LocalDocument, LoopbackProvider>;

const WORDS: &[&str] = &["lorem", "ipsum", " ", "dolor", "é", "😀", "\u{00a0}"];

#[derive(Parser, Debug)]
#[command(name = "collab-sim")]
#[command(about = "Randomized convergence simulator for collab-core")]
struct Args {
    /// Number of peers
    #[arg(short, long, default_value_t = 3)]
    peers: u64,

    /// Number of random operations
    #[arg(short, long, default_value_t = 500)]
    rounds: usize,

    /// RNG seed (random if not provided)
    #[arg(long)]
    seed: Option<u64>,

    /// Probability that a round toggles a peer's connection
    #[arg(long, default_value_t = 0.03)]
    churn: f64,

    /// Session config applied to every peer (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print per-peer sync stats as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PeerSummary {
    peer: String,
    nodes: usize,
    text_len: usize,
    stats: collab_core::SyncStats,
}

struct Simulation {
    rng: StdRng,
    churn: f64,
    sessions: Vec<Session>,
    edits: usize,
    toggles: usize,
}

impl Simulation {
    fn new(args: &Args, seed: u64, config: CollabConfig) -> Self {
        let hub = LoopbackHub::new();
        let sessions = (1..=args.peers)
            .map(|id| {
                let provider = hub.provider(PeerId::from(id));
                let model = if id == 1 {
                    LocalDocument::new(seed_document())
                } else {
                    LocalDocument::default()
                };
                let config = config
                    .clone()
                    .with_name(format!("peer-{}", id))
                    .with_bootstrap(id == 1);
                CollabSession::new(model, provider, "sim", config)
            })
            .collect();
        Self {
            rng: StdRng::seed_from_u64(seed),
            churn: args.churn.clamp(0.0, 1.0),
            sessions,
            edits: 0,
            toggles: 0,
        }
    }

    async fn connect_all(&mut self) -> Result<()> {
        let results = join_all(
            self.sessions
                .iter_mut()
                .filter(|s| !s.is_connected())
                .map(|s| s.connect()),
        )
        .await;
        for result in results {
            result.context("connect failed")?;
        }
        self.settle()
    }

    fn settle(&mut self) -> Result<()> {
        for _ in 0..10_000 {
            let mut processed = 0;
            for session in self.sessions.iter_mut() {
                processed += session.process_inbox()?;
                session.flush_tick()?;
            }
            if processed == 0 {
                return Ok(());
            }
        }
        bail!("network did not settle")
    }

    async fn round(&mut self) -> Result<()> {
        let who = self.rng.random_range(0..self.sessions.len());
        if self.rng.random_bool(self.churn) {
            let online = self.sessions[who].request_toggle_connection().await?;
            let state = if online { "online" } else { "offline" };
            debug!("{} is now {}", self.sessions[who].client_id(), state);
            self.toggles += 1;
        } else {
            self.random_edit(who)?;
            self.edits += 1;
        }
        if self.rng.random_bool(0.25) {
            self.settle()?;
        }
        Ok(())
    }

    fn random_edit(&mut self, who: usize) -> Result<()> {
        let snapshot = self.sessions[who].snapshot();
        let paras = snapshot.children(&NodeKey::root()).to_vec();
        let texts = text_nodes(&snapshot);
        let rng = &mut self.rng;
        let session = &mut self.sessions[who];

        match rng.random_range(0..12) {
            0..=5 if !texts.is_empty() => {
                let key = texts[rng.random_range(0..texts.len())].clone();
                let content = snapshot.text(&key).unwrap_or_default();
                let at = char_to_utf16(content, rng.random_range(0..=content.chars().count()));
                let word = WORDS[rng.random_range(0..WORDS.len())];
                session.update(|d| {
                    d.splice_text(&key, at, 0, word);
                })?;
                session.set_selection(Some(Selection::collapsed(Point::new(
                    key.clone(),
                    at + collab_core::text::utf16_len(word),
                ))));
            }
            6 if !texts.is_empty() => {
                let key = texts[rng.random_range(0..texts.len())].clone();
                let content = snapshot.text(&key).unwrap_or_default();
                let chars = content.chars().count();
                if chars > 0 {
                    let start = rng.random_range(0..chars);
                    let end = (start + rng.random_range(1..=3)).min(chars);
                    let from = char_to_utf16(content, start);
                    let to = char_to_utf16(content, end);
                    session.update(|d| {
                        d.splice_text(&key, from, to - from, "");
                    })?;
                }
            }
            7 => {
                let index = rng.random_range(0..=paras.len());
                session.update(|d| {
                    d.insert(
                        &NodeKey::root(),
                        index,
                        NodeSpec::paragraph().with_child(NodeSpec::text("new paragraph")),
                    );
                })?;
            }
            8 if paras.len() > 1 => {
                let key = paras[rng.random_range(0..paras.len())].clone();
                session.update(|d| {
                    d.remove(&key);
                })?;
            }
            9 if paras.len() > 1 => {
                let key = paras[rng.random_range(0..paras.len())].clone();
                let index = rng.random_range(0..paras.len());
                session.update(|d| {
                    d.move_node(&key, &NodeKey::root(), index);
                })?;
            }
            10 if !paras.is_empty() => {
                let key = paras[rng.random_range(0..paras.len())].clone();
                session.update(|d| {
                    d.append(&key, NodeSpec::line_break());
                })?;
            }
            11 if session.can_undo() => {
                session.undo()?;
            }
            _ if !paras.is_empty() => {
                let key = paras[rng.random_range(0..paras.len())].clone();
                let align = ["left", "center", "right"][rng.random_range(0..3)];
                session.update(|d| {
                    d.set_attr(&key, "align", serde_json::json!(align));
                })?;
            }
            _ => {}
        }
        Ok(())
    }

    fn check(&self) -> Result<()> {
        let expected = self.sessions[0].snapshot().structure();
        for session in &self.sessions {
            let snapshot = session.snapshot();
            if snapshot.structure() != expected {
                bail!("peer {} diverged", session.client_id());
            }
            let problems = session.binding().verify(&snapshot);
            if !problems.is_empty() {
                for problem in &problems {
                    warn!("{}: {}", session.client_id(), problem);
                }
                bail!("peer {} has {} shadow inconsistencies", session.client_id(), problems.len());
            }
        }
        Ok(())
    }

    fn summaries(&self) -> Vec<PeerSummary> {
        self.sessions
            .iter()
            .map(|session| {
                let snapshot = session.snapshot();
                PeerSummary {
                    peer: session.client_id().to_string(),
                    nodes: snapshot.len(),
                    text_len: snapshot.plain_text().chars().count(),
                    stats: session.stats().clone(),
                }
            })
            .collect()
    }
}

fn seed_document() -> Snapshot {
    Snapshot::from_specs([
        NodeSpec::element("heading")
            .with_attr("level", serde_json::json!(1))
            .with_child(NodeSpec::text("Shared notes")),
        NodeSpec::paragraph().with_child(NodeSpec::text("Everyone can edit this.")),
    ])
}

fn text_nodes(snapshot: &Snapshot) -> Vec<NodeKey> {
    snapshot
        .descendants(&NodeKey::root())
        .into_iter()
        .filter(|k| snapshot.get(k).is_some_and(|n| n.kind == NodeKind::Text))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to warn (or debug with --verbose)
    let default_filter = if args.verbose {
        "info,collab_core=debug,collab_sim=debug"
    } else {
        "warn,collab_sim=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.peers < 2 {
        bail!("need at least two peers");
    }
    let config = match &args.config {
        Some(path) => CollabConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CollabConfig::default(),
    };
    let seed = args.seed.unwrap_or_else(|| rand::rng().random());

    info!("Simulating {} peers for {} rounds (seed {})", args.peers, args.rounds, seed);
    let mut sim = Simulation::new(&args, seed, config);
    sim.connect_all().await?;

    for _ in 0..args.rounds {
        sim.round().await?;
    }
    sim.connect_all().await?;
    sim.check().with_context(|| format!("seed {}", seed))?;

    info!(
        "Converged after {} edits and {} connection toggles",
        sim.edits, sim.toggles
    );
    if args.json {
        println!("{}", serde_json::to_string_pretty(&sim.summaries())?);
    } else {
        for summary in sim.summaries() {
            println!(
                "{}: {} nodes, {} chars, {} pushes, {} pulls, {} moves, {} heals",
                summary.peer,
                summary.nodes,
                summary.text_len,
                summary.stats.pushes,
                summary.stats.pulls,
                summary.stats.moves,
                summary.stats.heals
            );
        }
    }
    Ok(())
}
