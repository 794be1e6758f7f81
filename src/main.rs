//! Fits a DeepONet to the sine benchmark and reports the held-out error.

use std::thread;

use crossbeam::channel;
use rand::prelude::*;

use rust_operator::callback::PrintTrainingLoss;
use rust_operator::dataset::{Dataset, SineBenchmark};
use rust_operator::loss::{dataset_loss, Objective};
use rust_operator::operator::{DeepOnet, DeepOnetConfig};
use rust_operator::trainer::{LrSchedule, StepRecord, Trainer, TrainerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rust_operator=info".parse()?),
        )
        .init();

    let mut rng = StdRng::seed_from_u64(42);
    let bench = SineBenchmark {
        num_functions: 32,
        num_sensors: 20,
        num_evaluations: 16,
        ..SineBenchmark::default()
    };
    let train = bench.generate::<f64, _>(&mut rng)?;
    let test = bench.generate::<f64, _>(&mut rng)?;

    let config = DeepOnetConfig::new(bench.num_sensors, 1, 1, 1)
        .with_branch(32, 2)
        .with_trunk(32, 2)
        .with_basis_functions(16);
    let operator: DeepOnet<f64> = DeepOnet::new(config, &mut rng)?;

    let (sender, receiver) = channel::unbounded::<StepRecord>();
    let printer = thread::spawn(move || {
        for record in receiver {
            if record.step % 100 == 0 {
                println!("step {:>5}  loss {:.3e}  {:.2?}", record.step, record.loss, record.elapsed);
            }
        }
    });

    let mut trainer = Trainer::new(
        Box::new(operator),
        TrainerConfig {
            learning_rate: 1e-3,
            batch_size: 8,
            max_epochs: 300,
            tolerance: 1e-4,
            lr_schedule: LrSchedule::Linear,
            ..TrainerConfig::default()
        },
    )?
    .with_sink(sender)
    .with_callback(Box::new(PrintTrainingLoss::new()));

    let report = trainer.fit(&train, Some(&test as &dyn Dataset<f64>))?;
    let held_out = dataset_loss(&test, trainer.operator(), &Objective::data(), 8)?;
    drop(trainer);
    printer.join().map_err(|_| "printer thread panicked")?;

    println!(
        "stopped after {} epochs ({:?}), held-out mse {:.3e}",
        report.epochs, report.reason, held_out
    );
    Ok(())
}
