use vfl_mpc::{
    channel::ChannelOptions,
    config::{LinearConfig, Objective},
    crypto::{
        LeveledScheme, Scheme,
        leveled::{self, Leveled},
        paillier::{self, Paillier},
        plain::Plain,
    },
    error::Error,
    inference::{predict_linear_active, predict_linear_passive},
    linear::{self, ArbiterReport},
    model::LinearModel,
    session::Role,
};

mod common;

use common::{Dataset, accuracy, init_tracing, separable, sessions};

const ROLES: [Role; 3] = [Role::Active, Role::Passive, Role::Arbiter];

fn config(iterations: u32) -> LinearConfig {
    LinearConfig {
        iterations,
        learning_rate: 0.1,
        lambda: 0.0,
        objective: Objective::Logistic,
        num_classes: 2,
        fit_bias: true,
    }
}

async fn train<S: Scheme>(
    data: &Dataset,
    config: &LinearConfig,
    params: &S::Params,
) -> Result<(LinearModel, LinearModel, ArbiterReport), Error> {
    let parties = sessions(&ROLES, ChannelOptions::default());
    let result = tokio::try_join!(
        linear::train_active::<S>(&parties[0], config, &data.shards[0], &data.labels),
        linear::train_passive::<S>(&parties[1], config, &data.shards[1]),
        linear::train_arbiter::<S>(&parties[2], config, params),
    )?;
    for party in parties {
        assert!(party.close().await.is_empty());
    }
    Ok(result)
}

async fn train_leveled<S: LeveledScheme>(
    data: &Dataset,
    config: &LinearConfig,
    params: &S::Params,
) -> Result<(LinearModel, LinearModel), Error> {
    let parties = sessions(&ROLES, ChannelOptions::default());
    let (active, passive, _) = tokio::try_join!(
        linear::leveled::train_active::<S>(&parties[0], config, &data.shards[0], &data.labels),
        linear::leveled::train_passive::<S>(&parties[1], config, &data.shards[1]),
        linear::leveled::train_arbiter::<S>(&parties[2], config, params),
    )?;
    for party in parties {
        assert!(party.close().await.is_empty());
    }
    Ok((active, passive))
}

fn assert_close(a: &[f64], b: &[f64], tolerance: f64) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < tolerance, "{x} and {y} differ by more than {tolerance}");
    }
}

#[tokio::test]
async fn plaintext_run_separates_the_classes() -> Result<(), Error> {
    init_tracing();
    let data = separable(100, &[2, 2], 0.2, 1);
    let (active, passive, report) = train::<Plain>(&data, &config(50), &()).await?;
    assert_eq!(report.losses.len(), 50);
    assert!(report.losses[49] < report.losses[0]);

    let parties = sessions(&[Role::Active, Role::Passive], ChannelOptions::default());
    let (predictions, ()) = tokio::try_join!(
        predict_linear_active(&parties[0], &active, &data.shards[0], 0),
        predict_linear_passive(&parties[1], &passive, &data.shards[1], 0),
    )?;
    let accuracy = accuracy(&predictions, &data.labels);
    assert!(accuracy >= 0.9, "accuracy {accuracy}");
    Ok(())
}

#[tokio::test]
async fn paillier_matches_plaintext() -> Result<(), Error> {
    init_tracing();
    let data = separable(40, &[2, 2], 0.2, 2);
    let config = config(5);
    let (plain_a, plain_b, plain_report) = train::<Plain>(&data, &config, &()).await?;
    let params = paillier::Params::insecure_for_tests();
    let (active, passive, report) = train::<Paillier>(&data, &config, &params).await?;
    assert_close(&active.weights, &plain_a.weights, 1e-3);
    assert_close(&[active.bias], &[plain_a.bias], 1e-3);
    assert_close(&passive.weights, &plain_b.weights, 1e-3);
    assert_close(&report.losses, &plain_report.losses, 1e-3);
    assert_eq!(passive.bias, 0.0);
    Ok(())
}

#[tokio::test]
async fn paillier_run_converges_like_plaintext() -> Result<(), Error> {
    init_tracing();
    let data = separable(100, &[2, 2], 0.2, 1);
    let config = config(50);
    let (plain_a, plain_b, _) = train::<Plain>(&data, &config, &()).await?;
    let params = paillier::Params::insecure_for_tests();
    let (active, passive, report) = train::<Paillier>(&data, &config, &params).await?;
    assert_eq!(report.losses.len(), 50);
    assert_close(&active.weights, &plain_a.weights, 1e-3);
    assert_close(&[active.bias], &[plain_a.bias], 1e-3);
    assert_close(&passive.weights, &plain_b.weights, 1e-3);

    let parties = sessions(&[Role::Active, Role::Passive], ChannelOptions::default());
    let (predictions, ()) = tokio::try_join!(
        predict_linear_active(&parties[0], &active, &data.shards[0], 0),
        predict_linear_passive(&parties[1], &passive, &data.shards[1], 0),
    )?;
    let accuracy = accuracy(&predictions, &data.labels);
    assert!(accuracy >= 0.9, "accuracy {accuracy}");
    Ok(())
}

#[tokio::test]
async fn leveled_run_refreshes_and_matches_plaintext() -> Result<(), Error> {
    init_tracing();
    let data = separable(40, &[2, 2], 0.2, 3);
    // depth 4 refreshes every 2 iterations, so 5 iterations need 2 refreshes
    let config = config(5);
    let (plain_a, plain_b) = train_leveled::<Plain>(&data, &config, &()).await?;
    let (active, passive) =
        train_leveled::<Leveled>(&data, &config, &leveled::Params::default()).await?;
    assert_close(&active.weights, &plain_a.weights, 1e-2);
    assert_close(&[active.bias], &[plain_a.bias], 1e-2);
    assert_close(&passive.weights, &plain_b.weights, 1e-2);
    Ok(())
}

#[tokio::test]
async fn squared_error_without_bias() -> Result<(), Error> {
    init_tracing();
    let mut data = separable(40, &[1, 1], 0.0, 4);
    let joined = data.joined();
    data.labels = joined.iter().map(|row| 2.0 * row[0] - row[1]).collect();
    let config = LinearConfig {
        objective: Objective::Linear,
        fit_bias: false,
        learning_rate: 0.5,
        ..config(200)
    };
    let (active, passive, report) = train::<Plain>(&data, &config, &()).await?;
    assert_eq!(active.bias, 0.0);
    assert!((active.weights[0] - 2.0).abs() < 0.1, "{:?}", active.weights);
    assert!((passive.weights[0] + 1.0).abs() < 0.1, "{:?}", passive.weights);
    assert!(report.losses[199] < 1e-2);
    Ok(())
}

#[tokio::test]
async fn invalid_configs_fail_every_party() {
    init_tracing();
    let data = separable(10, &[1, 1], 0.0, 5);
    let config = LinearConfig {
        num_classes: 3,
        ..config(1)
    };
    let result = train::<Plain>(&data, &config, &()).await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn too_shallow_depth_is_rejected_up_front() {
    init_tracing();
    let data = separable(10, &[1, 1], 0.0, 6);
    let params = leveled::Params {
        multiply_depth: 1,
        ..Default::default()
    };
    let result = train_leveled::<Leveled>(&data, &config(1), &params).await;
    assert!(matches!(
        result,
        Err(Error::CryptoBudgetExceeded {
            needed: 2,
            remaining: 1
        })
    ));
}
