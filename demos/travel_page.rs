//! Builds a travel page from the cheapest of several quotations and the first weather report to
//! arrive, each fetched from a simulated server with random latency.

use std::{
    fmt, thread,
    time::{Duration, Instant},
};

use rand::Rng;
use settle::{all, any, combine, compose, Future, Spawner, TaskFailure, WorkerPool};

#[derive(Debug, Clone)]
struct Quotation {
    server: String,
    amount: u32,
}

#[derive(Debug, Clone)]
struct Weather {
    server: String,
    weather: &'static str,
}

#[derive(Debug, Clone)]
struct TravelPage {
    quotation: Quotation,
    weather: Weather,
}

impl fmt::Display for TravelPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "best quote {} from {}, weather {} (reported by {})",
            self.quotation.amount, self.quotation.server, self.weather.weather, self.weather.server
        )
    }
}

fn simulate_latency() {
    thread::sleep(Duration::from_millis(rand::thread_rng().gen_range(80..120)));
}

fn fetch_quotations(spawner: &Spawner) -> Vec<Future<Quotation>> {
    [("Server A", 40..60), ("Server B", 40..70), ("Server C", 40..80)]
        .into_iter()
        .map(|(server, range)| {
            spawner.spawn(move || {
                simulate_latency();
                Quotation {
                    server: server.to_string(),
                    amount: rand::thread_rng().gen_range(range),
                }
            })
        })
        .collect()
}

fn fetch_weather(spawner: &Spawner) -> Vec<Future<Weather>> {
    ["Server A", "Server B", "Server C"]
        .into_iter()
        .map(|server| {
            spawner.spawn(move || {
                simulate_latency();
                Weather {
                    server: server.to_string(),
                    weather: "Sunny",
                }
            })
        })
        .collect()
}

fn best_quotation(quotations: &Future<Vec<Quotation>>) -> Future<Option<Quotation>> {
    quotations.map(|quotations| quotations.into_iter().min_by_key(|q| q.amount))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let pool = WorkerPool::builder().name("travel").fixed(4).build()?;
    let spawner = pool.spawner();

    let start = Instant::now();
    let quotations = all(fetch_quotations(&spawner));
    let weather = any(fetch_weather(&spawner))?;

    let collected = quotations.wait()?;
    println!("quotations: {collected:?}");

    let best = best_quotation(&quotations);
    let best = compose(best, |best| match best {
        Some(quotation) => Future::ready(quotation),
        None => Future::failed(TaskFailure::failed("no quotation received")),
    });
    println!(
        "best quote: {:?} ({}ms)",
        best.wait()?,
        start.elapsed().as_millis()
    );

    let page = compose(best.clone(), {
        let weather = weather.clone();
        move |quotation| weather.map(move |weather| TravelPage { quotation, weather })
    });
    println!("compose: {}", page.wait()?);

    let page = combine(best, weather, |quotation, weather| TravelPage {
        quotation,
        weather,
    });
    println!("combine: {}", page.join()?);

    Ok(())
}
