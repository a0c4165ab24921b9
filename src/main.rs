use adup::config::SimulationConfig;
use adup::error::FatalError;
use adup::metric::INFINITY;
use adup::scheduler::Simulation;
use adup::{RouterId, MICROS_PER_SEC};
use clap::Parser;
use log::error;

#[derive(Parser)]
#[command(name = "adup", about = "ADUP routing simulation: DUAL with a bandit tie-breaker")]
struct Cli {
    /// JSON simulation config; overrides the built-in topologies
    #[arg(long)]
    config: Option<String>,

    /// Built-in topology to generate
    #[arg(long, default_value = "line", value_parser = ["line", "ring", "star", "mesh"])]
    topology: String,

    /// Router count for the built-in topologies
    #[arg(long, default_value_t = 3)]
    routers: u32,

    /// Simulated run time in seconds
    #[arg(long, default_value_t = 60)]
    until: u64,

    /// RNG seed for bandit exploration and link loss
    #[arg(long)]
    seed: Option<u64>,

    /// Fail a link mid-run, formatted a:b:seconds
    #[arg(long)]
    link_down: Option<String>,

    /// Print the protocol event stream as JSON lines
    #[arg(long, default_value_t = false)]
    events: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let mut config = match &cli.config {
        Some(path) => match SimulationConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("configuration error: {}", e);
                return 2;
            }
        },
        None => match cli.topology.as_str() {
            "ring" => SimulationConfig::ring(cli.routers),
            "star" => SimulationConfig::star(cli.routers),
            "mesh" => SimulationConfig::mesh(cli.routers),
            _ => SimulationConfig::line(cli.routers),
        },
    };
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }

    let mut sim = match Simulation::configure(&config) {
        Ok(sim) => sim,
        Err(e) => {
            error!("configuration error: {}", e);
            return 2;
        }
    };

    if let Some(spec) = &cli.link_down {
        match parse_link_down(spec) {
            Some((a, b, at)) => {
                if let Err(e) = sim.schedule_link_down(at * MICROS_PER_SEC, a, b) {
                    error!("configuration error: {}", e);
                    return 2;
                }
            }
            None => {
                error!("configuration error: --link-down expects a:b:seconds, got {:?}", spec);
                return 2;
            }
        }
    }

    let receiver = cli.events.then(|| sim.subscribe());

    if let Err(e) = sim.run_until(cli.until * MICROS_PER_SEC) {
        match e {
            FatalError::Dual(v) => error!("simulation assertion violated: {}", v),
            FatalError::Scheduler(v) => error!("simulation assertion violated: {}", v),
        }
        return 3;
    }

    if let Some(receiver) = receiver {
        for event in receiver.try_iter() {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        }
    }

    report(&sim);
    0
}

fn parse_link_down(spec: &str) -> Option<(RouterId, RouterId, u64)> {
    let mut parts = spec.split(':');
    let a = parts.next()?.parse().ok()?;
    let b = parts.next()?.parse().ok()?;
    let at = parts.next()?.parse().ok()?;
    parts.next().is_none().then_some((a, b, at))
}

fn report(sim: &Simulation) {
    for router in sim.routers() {
        println!("\n--- R{} neighbor table ---", router.id());
        for neighbor in router.neighbor_table() {
            println!(
                "  {} {:?} last hello {:.2}s cost {}",
                neighbor.neighbor_id,
                neighbor.state,
                neighbor.last_hello as f64 / MICROS_PER_SEC as f64,
                if neighbor.link_cost == INFINITY {
                    "inf".to_string()
                } else {
                    neighbor.link_cost.to_string()
                },
            );
        }
        println!("--- R{} routing table ---", router.id());
        for route in router.routing_table() {
            match route.next_hop {
                Some(hop) => println!("  {} via {} metric {}", route.prefix, hop, route.metric),
                None => println!("  {} directly connected", route.prefix),
            }
        }
    }
}
