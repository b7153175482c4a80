// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A photo gallery that renders thumbnails on demand.
//!
//! Several viewer threads scroll over the same album. Each visible cell keeps a
//! [`KeyedHandle`] for its photo instead of the rendered pixels, so thumbnails that scroll out
//! of view can be evicted while cells that are still on screen keep theirs alive.

use std::thread;
use std::time::Duration;

use keyed_cache::{Cache, GetError, KeyedHandle, Loader};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const ALBUM_SIZE: u32 = 200;
const VISIBLE_CELLS: u32 = 12;
const MISSING_PHOTO: u32 = 13;

#[derive(Debug)]
struct Thumbnail {
    photo: u32,
    pixels: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
#[error("photo {0} is missing from the album")]
struct MissingPhoto(u32);

fn render(photo: &u32) -> Result<Thumbnail, MissingPhoto> {
    if *photo == MISSING_PHOTO {
        return Err(MissingPhoto(*photo));
    }
    thread::sleep(Duration::from_millis(2));
    Ok(Thumbnail {
        photo: *photo,
        pixels: vec![u8::try_from(photo % 256).unwrap_or_default(); 64 * 64],
    })
}

fn scroll<L>(viewer: u32, cache: &Cache<u32, Thumbnail, L>)
where
    L: Loader<u32, Thumbnail, Error = MissingPhoto>,
{
    for top in (0..ALBUM_SIZE - VISIBLE_CELLS).step_by(4) {
        let cells: Vec<KeyedHandle<u32, Thumbnail, L>> = (top..top + VISIBLE_CELLS).map(|photo| cache.handle(photo)).collect();

        // Each frame repaints every visible cell a few times.
        for _ in 0..3 {
            for cell in &cells {
                match cell.with(|thumbnail| thumbnail.pixels.len()) {
                    Ok(_) => {}
                    Err(GetError::Load(error)) => tracing::warn!(viewer, %error, "rendering failed"),
                    Err(error) => tracing::info!(viewer, photo = cell.key(), %error, "placeholder shown"),
                }
            }
        }
    }
}

fn main() {
    tracing_subscriber::registry().with(tracing_subscriber::fmt::layer()).init();

    let cache = Cache::builder(render).name("thumbnails").capacity(40).weak_capacity(80).build();
    let reporter = cache.report_stats(Duration::from_millis(50));

    thread::scope(|scope| {
        for viewer in 0..4 {
            let cache = &cache;
            scope.spawn(move || scroll(viewer, cache));
        }
    });

    let reclaimed = cache.reclaim();
    let stats = cache.stats();
    println!(
        "{} loads, {} hits, {} misses, {} demoted, {} reclaimed, hit ratio {:.2}",
        stats.loads,
        stats.hits,
        stats.misses,
        stats.demotions,
        reclaimed,
        stats.hit_ratio().unwrap_or_default()
    );

    if let Some(thumbnail) = cache.peek(&(ALBUM_SIZE - 1)) {
        println!("last photo still resident: {}", thumbnail.photo);
    }

    if let Some(reporter) = reporter {
        reporter.stop();
    }
}
