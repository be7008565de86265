//! Gradient exchange over a leveled scheme, with the weights kept encrypted.
//!
//! Each party holds `[w]` under the Arbiter's key and updates it homomorphically:
//!
//! * the partial scores `[s_i] = Σ_j c·x_ij [w_j]` (with `c = 0.25` for the logistic Taylor
//!   expansion and `c = 1` for squared error) cost one multiplication,
//! * Active combines them into `[d_i] = [s_a,i] + [s_b,i] + k_i`, where `k_i = 0.5 - y_i`
//!   (logistic) or `-y_i` (squared error), and sends `[d]` to Passive,
//! * the update `[w_j] <- (1 - lr·λ)[w_j] + Σ_i (-lr/n · x_ij)[d_i]` costs a second one.
//!
//! That makes [`MULTIPLIES_PER_ITERATION`] levels per iteration, so every
//! `floor(multiply_depth / 2)` iterations both parties mask their weights and let the Arbiter
//! re-encrypt them at full depth. The Arbiter only ever sees `w + m`. At the end of the run every
//! party recovers its plaintext weights through one masked decryption.
//!
//! Unlike the additive variant there is no loss sub-round: the loss needs `u²`, which is out of
//! reach without ciphertext-ciphertext multiplication.

use rand::Rng;
use tracing::{Level, debug, info, instrument};

use crate::{
    config::{LinearConfig, Objective, check_labels, shard_width},
    crypto::{LeveledScheme, Scheme, dot_plain, fresh_rng},
    error::Error,
    linear::{
        ArbiterReport, masked_decrypt,
        schedule::{RefreshSchedule, ensure_budget},
        serve_masked_decrypt, tag,
    },
    model::LinearModel,
    session::{Role, Session, acknowledged},
};

/// Levels consumed by the weights in one iteration.
pub const MULTIPLIES_PER_ITERATION: u32 = 2;

fn score_factor(objective: Objective) -> f64 {
    match objective {
        Objective::Logistic => 0.25,
        Objective::Linear => 1.0,
    }
}

fn schedule<S: LeveledScheme>(pk: &S::PublicKey) -> Result<RefreshSchedule, Error> {
    let schedule = RefreshSchedule::new(S::multiply_depth(pk), MULTIPLIES_PER_ITERATION)?;
    debug!("Refreshing every {} iterations", schedule.max_iter());
    Ok(schedule)
}

/// `[s_i] = Σ_j c·x_ij [w_j] + c·[b]`
fn encrypted_scores<S: Scheme>(
    pk: &S::PublicKey,
    features: &[Vec<f64>],
    weights: &[S::Ciphertext],
    bias: Option<&S::Ciphertext>,
    c: f64,
) -> Result<Vec<S::Ciphertext>, Error> {
    features
        .iter()
        .map(|row| -> Result<S::Ciphertext, Error> {
            let s = dot_plain::<S>(pk, weights, row.iter().map(|x| c * x))?;
            Ok(match bias {
                Some(b) => S::add(pk, &s, &S::mul_plain(pk, b, c)?)?,
                None => s,
            })
        })
        .collect()
}

/// One homomorphic gradient step on `[w]` (and `[b]`, if present as the last element).
fn step<S: LeveledScheme>(
    pk: &S::PublicKey,
    features: &[Vec<f64>],
    encrypted: &[S::Ciphertext],
    d: &[S::Ciphertext],
    config: &LinearConfig,
    width: usize,
) -> Result<Vec<S::Ciphertext>, Error> {
    for ct in encrypted {
        ensure_budget(S::levels_remaining(ct), MULTIPLIES_PER_ITERATION)?;
    }
    let rate = -config.learning_rate / features.len() as f64;
    let decay = 1.0 - config.learning_rate * config.lambda;
    let mut next = Vec::with_capacity(encrypted.len());
    for (j, w) in encrypted.iter().enumerate() {
        let grad = if j < width {
            dot_plain::<S>(pk, d, features.iter().map(|row| rate * row[j]))?
        } else {
            dot_plain::<S>(pk, d, features.iter().map(|_| rate))?
        };
        let kept = if j < width && decay != 1.0 {
            S::mul_plain(pk, w, decay)?
        } else {
            w.clone()
        };
        next.push(S::add(pk, &kept, &grad)?);
    }
    Ok(next)
}

/// Masks the ciphertexts and lets the Arbiter re-encrypt them at full depth.
async fn refresh<S: LeveledScheme, R: Rng>(
    session: &Session,
    pk: &S::PublicKey,
    cts: &[S::Ciphertext],
    round: u64,
    rng: &mut R,
) -> Result<Vec<S::Ciphertext>, Error> {
    let masks: Vec<S::Mask> = cts.iter().map(|_| S::draw_mask(pk, rng)).collect();
    let masked = cts
        .iter()
        .zip(&masks)
        .map(|(ct, mask)| S::apply_mask(pk, ct, mask))
        .collect::<Result<Vec<_>, _>>()?;
    session
        .send(Role::Arbiter, &format!("refresh_request/{round}"), &masked)
        .await?;
    let fresh: Vec<S::Ciphertext> = session
        .recv_vec(Role::Arbiter, &format!("refresh_reply/{round}"), cts.len())
        .await?;
    let refreshed = fresh
        .iter()
        .zip(masks)
        .map(|(ct, mask)| S::remove_mask(pk, ct, mask))
        .collect::<Result<Vec<_>, _>>()?;
    debug!("Refreshed {} ciphertexts before round {round}", refreshed.len());
    Ok(refreshed)
}

async fn serve_refresh<S: LeveledScheme, R: Rng>(
    session: &Session,
    pk: &S::PublicKey,
    sk: &S::SecretKey,
    peer: Role,
    round: u64,
    expected_len: &mut Option<usize>,
    rng: &mut R,
) -> Result<(), Error> {
    let request = format!("refresh_request/{round}");
    let masked: Vec<S::Ciphertext> = match *expected_len {
        Some(len) => session.recv_vec(peer, &request, len).await?,
        None => session.recv(peer, &request).await?,
    };
    *expected_len = Some(masked.len());
    let fresh = masked
        .iter()
        .map(|ct| S::refresh(pk, sk, ct, rng))
        .collect::<Result<Vec<_>, _>>()?;
    session
        .send(peer, &format!("refresh_reply/{round}"), &fresh)
        .await?;
    Ok(())
}

/// Trains the active party's share of the model with encrypted weights.
#[instrument(level = Level::DEBUG, skip_all, fields(scheme = S::NAME), err)]
pub async fn train_active<S: LeveledScheme>(
    session: &Session,
    config: &LinearConfig,
    features: &[Vec<f64>],
    labels: &[f64],
) -> Result<LinearModel, Error> {
    config.validate()?;
    let width = shard_width(features)?;
    let n = features.len();
    check_labels(config.objective, labels, n)?;
    let pk = session.recv_public_key::<S>(Role::Arbiter).await?;
    let mut schedule = schedule::<S>(&pk)?;
    let mut rng = fresh_rng();
    let c = score_factor(config.objective);
    let offsets: Vec<f64> = labels
        .iter()
        .map(|y| match config.objective {
            Objective::Logistic => 0.5 - y,
            Objective::Linear => -y,
        })
        .collect();
    let params = width + usize::from(config.fit_bias);
    let mut encrypted = (0..params)
        .map(|_| S::encrypt(&pk, 0.0, &mut rng))
        .collect::<Result<Vec<_>, _>>()?;
    for iteration in 0..config.iterations {
        let (round, due) = schedule.begin_iteration();
        if due {
            encrypted = refresh::<S, _>(session, &pk, &encrypted, round, &mut rng).await?;
        }
        let s_b = encrypted_scores::<S>(
            &pk,
            features,
            &encrypted[..width],
            encrypted.get(width),
            c,
        )?;
        let s_a: Vec<S::Ciphertext> = session
            .recv_vec(Role::Passive, &tag("encrypted_u_a", iteration), n)
            .await?;
        let d = s_a
            .iter()
            .zip(&s_b)
            .zip(&offsets)
            .map(|((a, b), &k)| -> Result<_, Error> {
                Ok(S::add_plain(&pk, &S::add(&pk, a, b)?, k)?)
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let sent_d = session.send_nowait(Role::Passive, &tag("encrypted_d", iteration), &d)?;
        let next = step::<S>(&pk, features, &encrypted, &d, config, width)?;
        acknowledged(sent_d).await?;
        encrypted = next;
        debug!("Iteration {iteration} committed");
    }
    let plain = masked_decrypt::<S, _>(
        session,
        &pk,
        &encrypted,
        "weights",
        config.iterations,
        &mut rng,
    )
    .await?;
    Ok(LinearModel {
        role: session.role(),
        weights: plain[..width].to_vec(),
        bias: plain.get(width).copied().unwrap_or(0.0),
        columns: (0..width).collect(),
        objective: config.objective,
    })
}

/// Trains the passive party's share of the model with encrypted weights.
#[instrument(level = Level::DEBUG, skip_all, fields(scheme = S::NAME), err)]
pub async fn train_passive<S: LeveledScheme>(
    session: &Session,
    config: &LinearConfig,
    features: &[Vec<f64>],
) -> Result<LinearModel, Error> {
    config.validate()?;
    let width = shard_width(features)?;
    let n = features.len();
    let pk = session.recv_public_key::<S>(Role::Arbiter).await?;
    let mut schedule = schedule::<S>(&pk)?;
    let mut rng = fresh_rng();
    let c = score_factor(config.objective);
    let mut encrypted = (0..width)
        .map(|_| S::encrypt(&pk, 0.0, &mut rng))
        .collect::<Result<Vec<_>, _>>()?;
    for iteration in 0..config.iterations {
        let (round, due) = schedule.begin_iteration();
        if due {
            encrypted = refresh::<S, _>(session, &pk, &encrypted, round, &mut rng).await?;
        }
        let s_a = encrypted_scores::<S>(&pk, features, &encrypted, None, c)?;
        session
            .send(Role::Active, &tag("encrypted_u_a", iteration), &s_a)
            .await?;
        let d: Vec<S::Ciphertext> = session
            .recv_vec(Role::Active, &tag("encrypted_d", iteration), n)
            .await?;
        encrypted = step::<S>(&pk, features, &encrypted, &d, config, width)?;
        debug!("Iteration {iteration} committed");
    }
    let weights = masked_decrypt::<S, _>(
        session,
        &pk,
        &encrypted,
        "weights",
        config.iterations,
        &mut rng,
    )
    .await?;
    Ok(LinearModel {
        role: session.role(),
        weights,
        bias: 0.0,
        columns: (0..width).collect(),
        objective: config.objective,
    })
}

/// Generates the key pair, refreshes ciphertexts on schedule and reveals the final weights.
#[instrument(level = Level::DEBUG, skip_all, fields(scheme = S::NAME), err)]
pub async fn train_arbiter<S: LeveledScheme>(
    session: &Session,
    config: &LinearConfig,
    params: &S::Params,
) -> Result<ArbiterReport, Error> {
    config.validate()?;
    let mut rng = fresh_rng();
    let (pk, sk) = S::keygen(params, &mut rng)?;
    let mut schedule = schedule::<S>(&pk)?;
    session
        .send_public_key::<S>(&[Role::Active, Role::Passive], &pk)
        .await?;
    let (mut passive_len, mut active_len) = (None, None);
    for _ in 0..config.iterations {
        let (round, due) = schedule.begin_iteration();
        if due {
            serve_refresh::<S, _>(
                session,
                &pk,
                &sk,
                Role::Passive,
                round,
                &mut passive_len,
                &mut rng,
            )
            .await?;
            serve_refresh::<S, _>(
                session,
                &pk,
                &sk,
                Role::Active,
                round,
                &mut active_len,
                &mut rng,
            )
            .await?;
            info!("Refreshed all weights before round {round}");
        }
    }
    let iterations = config.iterations;
    serve_masked_decrypt::<S>(session, &sk, Role::Passive, "weights", iterations, &mut passive_len)
        .await?;
    serve_masked_decrypt::<S>(session, &sk, Role::Active, "weights", iterations, &mut active_len)
        .await?;
    Ok(ArbiterReport::default())
}
