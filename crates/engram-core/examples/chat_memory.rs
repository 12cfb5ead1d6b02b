//! Minimal end-to-end walkthrough: open a store, remember a few messages,
//! then retrieve them through all three paths.
//!
//! Uses a hash-based stand-in for a real embedding service; swap in
//! `RemoteEmbedder` (feature `remote-embeddings`) for actual semantics.
//!
//! ```sh
//! cargo run --example chat_memory
//! ```

use std::sync::Arc;

use engram_core::{Database, FtsTokenizer, IndexParams, InsertMessage, Table};
use sha2::{Digest, Sha256};

const DIM: usize = 8;

fn stub_vector(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    digest
        .iter()
        .take(DIM)
        .map(|b| *b as f32 / 255.0)
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let db = Arc::new(Database::open(
        dir.path().join("memory.db"),
        FtsTokenizer::Unicode61,
    )?);

    let mut table = Table::open(Arc::clone(&db), "chat", IndexParams::new(DIM))?;
    table.set_embedder(|text| Ok(stub_vector(text)));

    table.add(&InsertMessage::new("uuid-ada", "the deploy finished cleanly").with_sender("Ada"))?;
    table.add(
        &InsertMessage::new("uuid-grace", "lunch at the usual place?")
            .with_sender("Grace")
            .with_forget_probability(0.9),
    )?;
    table.add(&InsertMessage::new("uuid-ada", "tagging the release now").with_sender("Ada"))?;

    println!("-- keyword: 'deploy'");
    for hit in table.search_list_fts("deploy", None)? {
        println!("  #{} {}: {}", hit.id, hit.sender.as_deref().unwrap_or("?"), hit.message);
    }

    println!("-- highlighted: 'release'");
    for hit in table.search_list_highlight_fts("release", "**", "**", None)? {
        println!("  #{}: {}", hit.id, hit.message);
    }

    println!("-- semantic: 'tagging the release now'");
    for hit in table.search_list_vector_text("tagging the release now", 2)? {
        println!("  #{} (distance {:.4}): {}", hit.id, hit.distance, hit.message);
    }

    let removed = table.forgotten()?;
    println!("-- forgetting pass removed {removed} message(s), {} remain", table.message_count()?);

    Ok(())
}
