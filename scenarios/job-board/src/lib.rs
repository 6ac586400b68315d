//! # job-board
//!
//! Simulated users of a job-board API: browsing and searching listings,
//! posting jobs, registering, and logging in. Browsing is weighted highest.
#![warn(
    missing_debug_implementations,
    missing_copy_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
use std::{fmt, time::Duration};

use async_trait::async_trait;
use rand::{Rng, seq::SliceRandom};
use serde::Deserialize;
use serde_json::json;
use tracing::trace;

use stampede_core::{
    behavior::{Action, Behavior, BehaviorError},
    error::ConfigError,
    scenario::{Scenario, ThinkTime},
    session::UserContext,
    transport::Request,
};

pub const SCENARIO: &str = "job_board";

pub const BROWSE_JOBS: &str = "browse_jobs";
pub const SEARCH_JOBS: &str = "search_jobs";
pub const CREATE_JOB: &str = "create_job";
pub const USER_REGISTRATION: &str = "user_registration";
pub const AUTHENTICATION: &str = "authentication";
pub const HEALTH_CHECK: &str = "health_check";

/// Stats key for single-job lookups, whatever the id.
pub const JOB_DETAIL: &str = "/api/v1/jobs/[id]";
pub const USER_PROFILE: &str = "/api/v1/user/profile";

static SKILLS: [&str; 6] = ["JavaScript", "Python", "React", "Node.js", "Angular", "Vue.js"];

/// The job-board user: 1-5s between behaviors, weights 3/2/1/1/1/1.
pub fn scenario() -> Result<Scenario, ConfigError> {
    Ok(Scenario::new(SCENARIO)
        .think_time(ThinkTime::between(
            Duration::from_secs(1),
            Duration::from_secs(5),
        )?)
        .on_start(StartSession)
        .behavior(Behavior::new(BROWSE_JOBS, 3, BrowseJobs))
        .behavior(Behavior::new(SEARCH_JOBS, 2, SearchJobs))
        .behavior(Behavior::new(CREATE_JOB, 1, CreateJob))
        .behavior(Behavior::new(USER_REGISTRATION, 1, RegisterUser))
        .behavior(Behavior::new(AUTHENTICATION, 1, Authenticate))
        .behavior(Behavior::unweighted(HEALTH_CHECK, HealthCheck)))
}

/// Ids come back as numbers or strings depending on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum JobId {
    Number(u64),
    Text(String),
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobId::Number(id) => write!(f, "{id}"),
            JobId::Text(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobRef {
    id: JobId,
}

#[derive(Debug, Default, Deserialize)]
struct JobList {
    #[serde(default)]
    jobs: Vec<JobRef>,
}

#[derive(Debug, Default, Deserialize)]
struct Created {
    id: Option<JobId>,
}

#[derive(Debug, Default, Deserialize)]
struct Login {
    token: Option<String>,
}

async fn view_job(ctx: &mut UserContext<'_>, id: &JobId) -> Result<(), BehaviorError> {
    ctx.request(Request::get(format!("/api/v1/jobs/{id}")).named(JOB_DETAIL))
        .await?;
    Ok(())
}

/// Per-user headers.
#[derive(Debug, Clone, Copy)]
pub struct StartSession;

#[async_trait]
impl Action for StartSession {
    async fn run(&self, ctx: &mut UserContext<'_>) -> Result<(), BehaviorError> {
        let user_id = format!("user_{}", ctx.rng().gen_range(1..=1_000_000));
        trace!(%user_id, "starting session");
        let session = ctx.session_mut();
        session.set_header("Content-Type", "application/json");
        session.set_header("User-Agent", "stampede load test");
        session.set_header("X-User-Id", user_id);
        Ok(())
    }
}

/// List jobs, then open one of them at random.
#[derive(Debug, Clone, Copy)]
pub struct BrowseJobs;

#[async_trait]
impl Action for BrowseJobs {
    async fn run(&self, ctx: &mut UserContext<'_>) -> Result<(), BehaviorError> {
        let response = ctx.request(Request::get("/api/v1/jobs")).await?;
        if response.status != 200 {
            return Ok(());
        }
        let list: JobList = response.json()?;
        let Some(job) = list.jobs.choose(ctx.rng()) else {
            return Ok(());
        };
        view_job(ctx, &job.id).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SearchJobs;

#[async_trait]
impl Action for SearchJobs {
    async fn run(&self, ctx: &mut UserContext<'_>) -> Result<(), BehaviorError> {
        let skill = SKILLS.choose(ctx.rng()).copied().unwrap_or("Rust");
        ctx.request(Request::get(format!("/api/v1/jobs?skills={skill}&limit=20")))
            .await?;
        Ok(())
    }
}

/// Post a job, then open it.
#[derive(Debug, Clone, Copy)]
pub struct CreateJob;

#[async_trait]
impl Action for CreateJob {
    async fn run(&self, ctx: &mut UserContext<'_>) -> Result<(), BehaviorError> {
        let rng = ctx.rng();
        let job = json!({
            "title": format!("Test Job {}", rng.gen_range(1..=1_000)),
            "description": "This is a test job created by stampede load testing.",
            "budget": rng.gen_range(100..=10_000),
            "skills": ["JavaScript", "React"],
            "duration": rng.gen_range(1..=30),
        });
        let response = ctx.request(Request::post("/api/v1/jobs").json(&job)?).await?;
        if !matches!(response.status, 200 | 201) {
            return Ok(());
        }
        let created: Created = response.json()?;
        match created.id {
            Some(id) => view_job(ctx, &id).await,
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegisterUser;

#[async_trait]
impl Action for RegisterUser {
    async fn run(&self, ctx: &mut UserContext<'_>) -> Result<(), BehaviorError> {
        let rng = ctx.rng();
        let user = json!({
            "email": format!("testuser{}@example.com", rng.gen_range(1..=1_000_000)),
            "password": "SecurePassword123!",
            "name": format!("Test User {}", rng.gen_range(1..=1_000)),
            "skills": ["JavaScript", "React"],
        });
        ctx.request(Request::post("/api/v1/auth/register").json(&user)?)
            .await?;
        Ok(())
    }
}

/// Log in; on success keep the bearer token for every later request of this
/// user and fetch the profile with it.
#[derive(Debug, Clone, Copy)]
pub struct Authenticate;

#[async_trait]
impl Action for Authenticate {
    async fn run(&self, ctx: &mut UserContext<'_>) -> Result<(), BehaviorError> {
        let credentials = json!({
            "email": "test@example.com",
            "password": "password123",
        });
        let response = ctx
            .request(Request::post("/api/v1/auth/login").json(&credentials)?)
            .await?;
        let token = match response.status {
            200 => response.json::<Login>()?.token,
            _ => None,
        };
        let Some(token) = token else {
            // a failed login leaves this user logged out
            ctx.session_mut().remove_header("Authorization");
            return Ok(());
        };
        ctx.session_mut()
            .set_header("Authorization", format!("Bearer {token}"));
        ctx.request(Request::get(USER_PROFILE).named(USER_PROFILE))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthCheck;

#[async_trait]
impl Action for HealthCheck {
    async fn run(&self, ctx: &mut UserContext<'_>) -> Result<(), BehaviorError> {
        ctx.request(Request::get("/health")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stampede_core::{
        coordinator::Workload,
        outcome_stats::{Recorder, StatsSnapshot},
        testing::ScriptedTransport,
        transport::Request,
        user::{SimulatedUser, error_key},
    };
    use tokio_util::sync::CancellationToken;

    use super::*;

    /// Run one user doing only `behavior` (after the usual on_start) for
    /// `span`, one execution per second.
    async fn run_only<A: Action>(
        name: &str,
        action: A,
        transport: ScriptedTransport,
        span: Duration,
    ) -> StatsSnapshot {
        let scenario = Scenario::new("single")
            .on_start(StartSession)
            .behavior(Behavior::new(name.to_owned(), 1, action))
            .think_time(ThinkTime::constant(Duration::from_secs(1)));
        let workload = Workload::new(scenario, Arc::new(transport)).expect("workload");
        let recorder = Arc::new(Recorder::new());
        let token = CancellationToken::new();
        let (user, _state) = SimulatedUser::new(0, workload, Arc::clone(&recorder), Some(3), token.clone());
        let handle = tokio::spawn(user.run());
        tokio::time::sleep(span).await;
        token.cancel();
        handle.await.expect("user task");
        recorder.flush()
    }

    fn paths(requests: &[Request]) -> Vec<&str> {
        requests.iter().map(|r| r.path.as_str()).collect()
    }

    #[test]
    fn scenario_matches_declared_weights() {
        let scenario = scenario().expect("valid scenario");
        let weights: Vec<_> = scenario
            .behaviors()
            .iter()
            .map(|b| (b.name(), b.weight()))
            .collect();
        assert_eq!(
            weights,
            vec![
                (BROWSE_JOBS, 3),
                (SEARCH_JOBS, 2),
                (CREATE_JOB, 1),
                (USER_REGISTRATION, 1),
                (AUTHENTICATION, 1),
                (HEALTH_CHECK, 1),
            ]
        );
        assert_eq!(scenario.wait_time().min(), Duration::from_secs(1));
        assert_eq!(scenario.wait_time().max(), Duration::from_secs(5));
        assert!(scenario.start_action().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn browse_opens_a_listed_job() {
        let transport =
            ScriptedTransport::ok().route("/api/v1/jobs", 200, r#"{"jobs":[{"id":7},{"id":7}]}"#);
        let seen = transport.requests();
        let snapshot = run_only(BROWSE_JOBS, BrowseJobs, transport, Duration::from_millis(500)).await;

        assert_eq!(paths(&seen.lock()), vec!["/api/v1/jobs", "/api/v1/jobs/7"]);
        assert_eq!(snapshot.get(BROWSE_JOBS).map(|s| s.requests), Some(1));
        assert_eq!(snapshot.get(JOB_DETAIL).map(|s| s.requests), Some(1));
        assert!(seen.lock().iter().all(|r| r.headers.contains_key("X-User-Id")));
    }

    #[tokio::test(start_paused = true)]
    async fn login_token_is_used_by_later_requests() {
        let transport = ScriptedTransport::ok().route("/api/v1/auth/login", 200, r#"{"token":"abc"}"#);
        let seen = transport.requests();
        run_only(AUTHENTICATION, Authenticate, transport, Duration::from_millis(1_500)).await;

        let requests = seen.lock();
        assert_eq!(
            paths(&requests),
            vec![
                "/api/v1/auth/login",
                USER_PROFILE,
                "/api/v1/auth/login",
                USER_PROFILE
            ]
        );
        assert!(!requests[0].headers.contains_key("Authorization"));
        for request in &requests[1..] {
            assert_eq!(
                request.headers.get("Authorization").map(String::as_str),
                Some("Bearer abc")
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn created_job_is_opened() {
        let transport = ScriptedTransport::ok().route("/api/v1/jobs", 201, r#"{"id":"j-1"}"#);
        let seen = transport.requests();
        run_only(CREATE_JOB, CreateJob, transport, Duration::from_millis(500)).await;

        let requests = seen.lock();
        assert_eq!(paths(&requests), vec!["/api/v1/jobs", "/api/v1/jobs/j-1"]);
        let body: serde_json::Value =
            serde_json::from_slice(requests[0].body.as_deref().expect("body")).expect("json body");
        let budget = body["budget"].as_u64().expect("budget");
        assert!((100..=10_000).contains(&budget));
        assert!(body["title"].as_str().expect("title").starts_with("Test Job "));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_service_counts_failures() {
        let transport = ScriptedTransport::ok().route("/health", 503, "");
        let snapshot = run_only(HEALTH_CHECK, HealthCheck, transport, Duration::from_millis(2_500)).await;

        let health = snapshot.get(HEALTH_CHECK).expect("health outcomes");
        assert_eq!(health.requests, 3);
        assert_eq!(health.failures, 3);
        assert_eq!(health.errors.get("HTTP 503"), Some(&3));
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_listing_is_one_failure() {
        let transport = ScriptedTransport::ok().route("/api/v1/jobs", 200, "<html>");
        let snapshot = run_only(BROWSE_JOBS, BrowseJobs, transport, Duration::from_millis(500)).await;

        // the request itself succeeded; decoding its body did not
        let browse = snapshot.get(BROWSE_JOBS).expect("browse outcomes");
        assert_eq!(browse.requests, 1);
        assert_eq!(browse.failures, 0);
        let decode = snapshot.get(&error_key(BROWSE_JOBS)).expect("decode failure");
        assert_eq!(decode.requests, 1);
        assert_eq!(decode.failures, 1);
    }
}
