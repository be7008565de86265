//! Vertical linear and logistic regression through masked gradient exchange.
//!
//! Three parties take part: the [`Role::Active`] party holds the labels and a feature shard, the
//! [`Role::Passive`] party holds another feature shard of the same samples, and the
//! [`Role::Arbiter`] owns the key pair but never sees a gradient in the clear. Every iteration
//! runs the following choreography to completion before the next one starts:
//!
//! 1. Passive encrypts its partial scores `u_a = X_a · w_a` (and their squares, for the loss) and
//!    sends them to Active.
//! 2. Active adds its own score `u_b = X_b · w_b + b` under encryption and forms the residuals
//!    `[d]`, using the Taylor expansion `0.25 u - y + 0.5` of the logistic loss gradient, since an
//!    additive scheme can not evaluate the sigmoid. It sends `[d]` back to Passive and the
//!    encrypted approximate loss to the Arbiter.
//! 3. Both parties compute their encrypted gradients `[X^T d]` (plaintext times ciphertext),
//!    add a fresh random mask and send the result to the Arbiter.
//! 4. The Arbiter decrypts the masked gradients and returns them to their senders.
//! 5. Each party removes its mask and commits the update `w -= lr * (grad / n + λ w)`.
//!
//! A mask is drawn for one iteration only and consumed when it is removed. An iteration that fails
//! halfway leaves the weights of the previous iteration untouched.
//!
//! The leveled variant in [`leveled`] keeps the weights encrypted instead and refreshes them
//! according to a [`schedule::RefreshSchedule`].

use rand::Rng;
use tracing::{Level, debug, info, instrument};

use crate::{
    config::{LinearConfig, Objective, check_labels, shard_width},
    crypto::{Scheme, dot_plain, encrypt_all, fresh_rng, sum},
    error::Error,
    model::LinearModel,
    session::{Role, Session, acknowledged},
};

pub mod leveled;
pub mod schedule;

/// What the Arbiter learned during a training run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArbiterReport {
    /// The approximate training loss of every iteration.
    pub losses: Vec<f64>,
}

pub(crate) fn tag(name: &str, iteration: u32) -> String {
    format!("{name}/{iteration}")
}

pub(crate) fn scores(features: &[Vec<f64>], weights: &[f64], bias: f64) -> Vec<f64> {
    features
        .iter()
        .map(|row| row.iter().zip(weights).map(|(x, w)| x * w).sum::<f64>() + bias)
        .collect()
}

/// `w - lr * (grad / n + λ w)`
fn updated(weights: &[f64], grad: &[f64], config: &LinearConfig, n: usize) -> Vec<f64> {
    weights
        .iter()
        .zip(grad)
        .map(|(w, g)| w - config.learning_rate * (g / n as f64 + config.lambda * w))
        .collect()
}

/// `[X^T d]`, one ciphertext per column.
fn gradient<S: Scheme>(
    pk: &S::PublicKey,
    features: &[Vec<f64>],
    d: &[S::Ciphertext],
    width: usize,
) -> Result<Vec<S::Ciphertext>, Error> {
    (0..width)
        .map(|j| -> Result<_, Error> {
            Ok(dot_plain::<S>(pk, d, features.iter().map(|row| row[j]))?)
        })
        .collect()
}

/// `[d_i]` from the passive party's encrypted score and the active party's plaintext terms.
fn residual<S: Scheme>(
    pk: &S::PublicKey,
    objective: Objective,
    u_a: &S::Ciphertext,
    u_b: f64,
    y: f64,
) -> Result<S::Ciphertext, Error> {
    Ok(match objective {
        Objective::Logistic => {
            S::add_plain(pk, &S::mul_plain(pk, u_a, 0.25)?, 0.25 * u_b - y + 0.5)?
        }
        Objective::Linear => S::add_plain(pk, u_a, u_b - y)?,
    })
}

/// The mean approximate loss, expanded into terms linear in `[u_a]` and `[u_a²]`.
fn encrypted_loss<S: Scheme>(
    pk: &S::PublicKey,
    objective: Objective,
    u_a: &[S::Ciphertext],
    u_a_square: &[S::Ciphertext],
    u_b: &[f64],
    labels: &[f64],
) -> Result<S::Ciphertext, Error> {
    let mut terms = Vec::with_capacity(labels.len());
    for (((ua, ua2), &ub), &y) in u_a.iter().zip(u_a_square).zip(u_b).zip(labels) {
        // loss_i = c_sq * u_a² + c_a * u_a + c
        let (c_sq, c_a, c) = match objective {
            Objective::Logistic => (
                0.125,
                0.5 - y + 0.25 * ub,
                std::f64::consts::LN_2 + (0.5 - y) * ub + 0.125 * ub * ub,
            ),
            Objective::Linear => (0.5, ub - y, 0.5 * (ub - y) * (ub - y)),
        };
        let term = S::add(pk, &S::mul_plain(pk, ua2, c_sq)?, &S::mul_plain(pk, ua, c_a)?)?;
        terms.push(S::add_plain(pk, &term, c)?);
    }
    let total = sum::<S>(pk, &terms)?
        .ok_or_else(|| Error::ProtocolViolation("loss over zero samples".into()))?;
    Ok(S::mul_plain(pk, &total, 1.0 / labels.len() as f64)?)
}

/// Masks ciphertexts, lets the Arbiter decrypt them and removes the masks again.
pub(crate) async fn masked_decrypt<S: Scheme, R: Rng>(
    session: &Session,
    pk: &S::PublicKey,
    cts: &[S::Ciphertext],
    name: &str,
    iteration: u32,
    rng: &mut R,
) -> Result<Vec<f64>, Error> {
    let masks: Vec<S::Mask> = cts.iter().map(|_| S::draw_mask(pk, rng)).collect();
    let masked = cts
        .iter()
        .zip(&masks)
        .map(|(ct, mask)| S::apply_mask(pk, ct, mask))
        .collect::<Result<Vec<_>, _>>()?;
    let request = tag(&format!("encrypted_masked_{name}"), iteration);
    session.send(Role::Arbiter, &request, &masked).await?;
    let reply = tag(&format!("masked_{name}"), iteration);
    let decrypted: Vec<S::MaskedPlaintext> =
        session.recv_vec(Role::Arbiter, &reply, cts.len()).await?;
    let plain = decrypted
        .iter()
        .zip(masks)
        .map(|(value, mask)| S::unmask(pk, value, mask))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(plain)
}

/// Answers one [`masked_decrypt`] request, checking that its length stays the same.
pub(crate) async fn serve_masked_decrypt<S: Scheme>(
    session: &Session,
    sk: &S::SecretKey,
    peer: Role,
    name: &str,
    iteration: u32,
    expected_len: &mut Option<usize>,
) -> Result<(), Error> {
    let request = tag(&format!("encrypted_masked_{name}"), iteration);
    let masked: Vec<S::Ciphertext> = match *expected_len {
        Some(len) => session.recv_vec(peer, &request, len).await?,
        None => session.recv(peer, &request).await?,
    };
    *expected_len = Some(masked.len());
    let decrypted = masked
        .iter()
        .map(|ct| S::decrypt_masked(sk, ct))
        .collect::<Result<Vec<_>, _>>()?;
    let reply = tag(&format!("masked_{name}"), iteration);
    session.send(peer, &reply, &decrypted).await?;
    debug!("Decrypted {} masked values for {peer}", decrypted.len());
    Ok(())
}

/// Trains the active party's share of the model (labels, own features and the bias).
#[instrument(level = Level::DEBUG, skip_all, fields(scheme = S::NAME), err)]
pub async fn train_active<S: Scheme>(
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
    let mut rng = fresh_rng();
    let mut weights = vec![0.0; width];
    let mut bias = 0.0;
    for iteration in 0..config.iterations {
        let u_a: Vec<S::Ciphertext> = session
            .recv_vec(Role::Passive, &tag("encrypted_u_a", iteration), n)
            .await?;
        let u_a_square: Vec<S::Ciphertext> = session
            .recv_vec(Role::Passive, &tag("encrypted_u_a_square", iteration), n)
            .await?;
        let u_b = scores(features, &weights, bias);
        let d = u_a
            .iter()
            .zip(&u_b)
            .zip(labels)
            .map(|((ua, &ub), &y)| residual::<S>(&pk, config.objective, ua, ub, y))
            .collect::<Result<Vec<_>, _>>()?;
        let sent_d = session.send_nowait(Role::Passive, &tag("encrypted_d", iteration), &d)?;
        let loss =
            encrypted_loss::<S>(&pk, config.objective, &u_a, &u_a_square, &u_b, labels)?;
        session
            .send(Role::Arbiter, &tag("encrypted_loss", iteration), &loss)
            .await?;
        let mut grad = gradient::<S>(&pk, features, &d, width)?;
        if config.fit_bias {
            let bias_grad = sum::<S>(&pk, &d)?
                .ok_or_else(|| Error::ProtocolViolation("no residuals".into()))?;
            grad.push(bias_grad);
        }
        let grad = masked_decrypt::<S, _>(session, &pk, &grad, "dJ_b", iteration, &mut rng).await?;
        acknowledged(sent_d).await?;
        let new_weights = updated(&weights, &grad[..width], config, n);
        if config.fit_bias {
            bias -= config.learning_rate * grad[width] / n as f64;
        }
        weights = new_weights;
        debug!("Iteration {iteration} committed");
    }
    Ok(LinearModel {
        role: session.role(),
        weights,
        bias,
        columns: (0..width).collect(),
        objective: config.objective,
    })
}

/// Trains the passive party's share of the model (own features only).
#[instrument(level = Level::DEBUG, skip_all, fields(scheme = S::NAME), err)]
pub async fn train_passive<S: Scheme>(
    session: &Session,
    config: &LinearConfig,
    features: &[Vec<f64>],
) -> Result<LinearModel, Error> {
    config.validate()?;
    let width = shard_width(features)?;
    let n = features.len();
    let pk = session.recv_public_key::<S>(Role::Arbiter).await?;
    let mut rng = fresh_rng();
    let mut weights = vec![0.0; width];
    for iteration in 0..config.iterations {
        let u_a = scores(features, &weights, 0.0);
        let u_a_square: Vec<f64> = u_a.iter().map(|u| u * u).collect();
        let encrypted = encrypt_all::<S, _>(&pk, &u_a, &mut rng)?;
        let encrypted_square = encrypt_all::<S, _>(&pk, &u_a_square, &mut rng)?;
        session
            .send(Role::Active, &tag("encrypted_u_a", iteration), &encrypted)
            .await?;
        session
            .send(
                Role::Active,
                &tag("encrypted_u_a_square", iteration),
                &encrypted_square,
            )
            .await?;
        let d: Vec<S::Ciphertext> = session
            .recv_vec(Role::Active, &tag("encrypted_d", iteration), n)
            .await?;
        let grad = gradient::<S>(&pk, features, &d, width)?;
        let grad = masked_decrypt::<S, _>(session, &pk, &grad, "dJ_a", iteration, &mut rng).await?;
        weights = updated(&weights, &grad, config, n);
        debug!("Iteration {iteration} committed");
    }
    Ok(LinearModel {
        role: session.role(),
        weights,
        bias: 0.0,
        columns: (0..width).collect(),
        objective: config.objective,
    })
}

/// Generates the key pair and decrypts masked gradients and the loss for the other parties.
#[instrument(level = Level::DEBUG, skip_all, fields(scheme = S::NAME), err)]
pub async fn train_arbiter<S: Scheme>(
    session: &Session,
    config: &LinearConfig,
    params: &S::Params,
) -> Result<ArbiterReport, Error> {
    config.validate()?;
    let mut rng = fresh_rng();
    let (pk, sk) = S::keygen(params, &mut rng)?;
    session
        .send_public_key::<S>(&[Role::Active, Role::Passive], &pk)
        .await?;
    let mut report = ArbiterReport::default();
    let (mut passive_len, mut active_len) = (None, None);
    for iteration in 0..config.iterations {
        let loss: S::Ciphertext = session
            .recv(Role::Active, &tag("encrypted_loss", iteration))
            .await?;
        let loss = S::decrypt(&sk, &loss)?;
        info!("Iteration {iteration}: approximate loss {loss:.6}");
        report.losses.push(loss);
        serve_masked_decrypt::<S>(session, &sk, Role::Passive, "dJ_a", iteration, &mut passive_len)
            .await?;
        serve_masked_decrypt::<S>(session, &sk, Role::Active, "dJ_b", iteration, &mut active_len)
            .await?;
    }
    Ok(report)
}
