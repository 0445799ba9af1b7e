use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info};

use skyhook_vehicle::Vehicle;

/// Delay between state transitions, and between timed-state re-entries.
const STATE_MACHINE_DELAY: Duration = Duration::from_millis(50);

/// What a state handler tells the machine to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Enter the named state next. Returning the current state's own name
    /// re-enters it immediately.
    To(String),
    /// Terminate the mission.
    Done,
}

impl Transition {
    pub fn to(name: impl Into<String>) -> Self {
        Transition::To(name.into())
    }
}

#[derive(Debug, Error)]
pub enum MissionError {
    #[error("no initial state declared")]
    NoInitialState,
    #[error("initial state {0:?} is not a declared state")]
    UnknownInitialState(String),
    #[error("state {0:?} declared twice")]
    DuplicateState(String),
    #[error("transition to unknown state {state:?} (known: {known:?})")]
    InvalidState { state: String, known: Vec<String> },
}

type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type StateHandler = Arc<dyn Fn(Vehicle) -> BoxFut<anyhow::Result<Transition>> + Send + Sync>;
type TaskHandler = Arc<dyn Fn(Vehicle) -> BoxFut<anyhow::Result<()>> + Send + Sync>;

struct TimedSpec {
    duration: Duration,
    looped: bool,
}

struct StateDef {
    handler: StateHandler,
    timed: Option<TimedSpec>,
}

/// Entry-point runner: invoke one user future with the vehicle, then
/// disconnect regardless of the outcome.
pub async fn run_mission<F, Fut>(vehicle: Vehicle, mission: F) -> anyhow::Result<()>
where
    F: FnOnce(Vehicle) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let result = mission(vehicle.clone()).await;
    vehicle.disconnect().await;
    result
}

pub struct StateMachineBuilder {
    states: HashMap<String, StateDef>,
    initial: Option<String>,
    backgrounds: Vec<TaskHandler>,
    at_init: Vec<TaskHandler>,
    duplicate: Option<String>,
}

impl Default for StateMachineBuilder {
    fn default() -> Self {
        StateMachine::builder()
    }
}

impl StateMachineBuilder {
    fn add_state(&mut self, name: &str, def: StateDef) {
        if self.states.contains_key(name) && self.duplicate.is_none() {
            self.duplicate = Some(name.to_string());
        }
        self.states.insert(name.to_string(), def);
    }

    pub fn state<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Vehicle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Transition>> + Send + 'static,
    {
        self.add_state(
            name,
            StateDef {
                handler: Arc::new(move |v| Box::pin(handler(v))),
                timed: None,
            },
        );
        self
    }

    /// A timed state runs its body, then holds the transition until
    /// `duration` has elapsed; with `looped` the body is re-invoked until
    /// then and the last returned transition wins.
    pub fn timed_state<F, Fut>(
        mut self,
        name: &str,
        duration: Duration,
        looped: bool,
        handler: F,
    ) -> Self
    where
        F: Fn(Vehicle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Transition>> + Send + 'static,
    {
        self.add_state(
            name,
            StateDef {
                handler: Arc::new(move |v| Box::pin(handler(v))),
                timed: Some(TimedSpec { duration, looped }),
            },
        );
        self
    }

    /// Declare the initial state by name. Exactly one is required.
    pub fn initial(mut self, name: &str) -> Self {
        self.initial = Some(name.to_string());
        self
    }

    /// Background task running concurrently with the state machine for the
    /// whole mission. An error here terminates the mission.
    pub fn background<F, Fut>(mut self, task: F) -> Self
    where
        F: Fn(Vehicle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.backgrounds.push(Arc::new(move |v| Box::pin(task(v))));
        self
    }

    /// Hook run once before the first state, on the state-machine task.
    pub fn at_init<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Vehicle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.at_init.push(Arc::new(move |v| Box::pin(hook(v))));
        self
    }

    pub fn build(self) -> Result<StateMachine, MissionError> {
        if let Some(name) = self.duplicate {
            return Err(MissionError::DuplicateState(name));
        }
        let initial = self.initial.ok_or(MissionError::NoInitialState)?;
        if !self.states.contains_key(&initial) {
            return Err(MissionError::UnknownInitialState(initial));
        }
        Ok(StateMachine {
            states: self.states,
            initial,
            backgrounds: self.backgrounds,
            at_init: self.at_init,
        })
    }
}

/// State-machine mission: named handlers, one initial state, optional
/// timed states and background tasks.
pub struct StateMachine {
    states: HashMap<String, StateDef>,
    initial: String,
    backgrounds: Vec<TaskHandler>,
    at_init: Vec<TaskHandler>,
}

impl StateMachine {
    pub fn builder() -> StateMachineBuilder {
        StateMachineBuilder {
            states: HashMap::new(),
            initial: None,
            backgrounds: Vec::new(),
            at_init: Vec::new(),
            duplicate: None,
        }
    }

    /// Drive the machine to termination. The vehicle is expected to be
    /// connected; wrap with [`run_mission`] for connect/disconnect
    /// handling.
    pub async fn run(&self, vehicle: Vehicle) -> anyhow::Result<()> {
        for hook in &self.at_init {
            hook(vehicle.clone()).await?;
        }

        let mut background: JoinSet<anyhow::Result<()>> = JoinSet::new();
        for task in &self.backgrounds {
            let fut = task(vehicle.clone());
            background.spawn(fut);
        }

        let mut current = self.initial.clone();
        let outcome = loop {
            let Some(def) = self.states.get(&current) else {
                break Err(MissionError::InvalidState {
                    state: current,
                    known: self.states.keys().cloned().collect(),
                }
                .into());
            };
            debug!(state = %current, "entering state");

            let step = Self::run_state(def, vehicle.clone());
            tokio::pin!(step);
            let transition = tokio::select! {
                result = &mut step => match result {
                    Ok(transition) => transition,
                    Err(e) => break Err(e),
                },
                failure = background_failure(&mut background) => break Err(failure),
            };

            match transition {
                Transition::Done => break Ok(()),
                Transition::To(next) => {
                    current = next;
                    tokio::time::sleep(STATE_MACHINE_DELAY).await;
                }
            }
        };

        background.abort_all();
        while background.join_next().await.is_some() {}
        match &outcome {
            Ok(()) => info!("state machine finished"),
            Err(e) => error!("state machine terminated: {e:#}"),
        }
        outcome
    }

    async fn run_state(def: &StateDef, vehicle: Vehicle) -> anyhow::Result<Transition> {
        match &def.timed {
            None => (def.handler)(vehicle).await,
            Some(spec) => {
                let started = Instant::now();
                let mut last = (def.handler)(vehicle.clone()).await?;
                if spec.looped {
                    while started.elapsed() < spec.duration {
                        tokio::time::sleep(STATE_MACHINE_DELAY).await;
                        if started.elapsed() >= spec.duration {
                            break;
                        }
                        last = (def.handler)(vehicle.clone()).await?;
                    }
                } else if started.elapsed() < spec.duration {
                    tokio::time::sleep(spec.duration - started.elapsed()).await;
                }
                Ok(last)
            }
        }
    }
}

/// Resolve only when a background task fails (error or panic); pends
/// forever otherwise, including when the set empties out.
async fn background_failure(set: &mut JoinSet<anyhow::Result<()>>) -> anyhow::Error {
    loop {
        match set.join_next().await {
            None => std::future::pending::<()>().await,
            Some(Ok(Ok(()))) => continue,
            Some(Ok(Err(e))) => return e.context("background task failed"),
            Some(Err(join_error)) => {
                return anyhow::anyhow!("background task panicked: {join_error}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    use skyhook_link::MockLink;
    use skyhook_vehicle::{Vehicle, VehicleOptions};

    fn test_vehicle() -> Vehicle {
        Vehicle::new(StdArc::new(MockLink::new()), VehicleOptions::default())
    }

    #[tokio::test]
    async fn states_run_in_declared_order() {
        let trace: StdArc<std::sync::Mutex<Vec<&'static str>>> = StdArc::default();
        let t1 = trace.clone();
        let t2 = trace.clone();
        let machine = StateMachine::builder()
            .state("takeoff", move |_v| {
                let t = t1.clone();
                async move {
                    t.lock().unwrap().push("takeoff");
                    Ok(Transition::to("cruise"))
                }
            })
            .state("cruise", move |_v| {
                let t = t2.clone();
                async move {
                    t.lock().unwrap().push("cruise");
                    Ok(Transition::Done)
                }
            })
            .initial("takeoff")
            .build()
            .unwrap();

        machine.run(test_vehicle()).await.unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!["takeoff", "cruise"]);
    }

    #[tokio::test]
    async fn returning_own_name_reenters() {
        let count = StdArc::new(AtomicU32::new(0));
        let c = count.clone();
        let machine = StateMachine::builder()
            .state("spin", move |_v| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Ok(Transition::to("spin"))
                    } else {
                        Ok(Transition::Done)
                    }
                }
            })
            .initial("spin")
            .build()
            .unwrap();
        machine.run(test_vehicle()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timed_loop_state_reinvokes_until_duration() {
        let count = StdArc::new(AtomicU32::new(0));
        let c = count.clone();
        let machine = StateMachine::builder()
            .timed_state("sample", Duration::from_millis(300), true, move |_v| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    // The declared transition is deferred until the
                    // duration elapses.
                    Ok(Transition::Done)
                }
            })
            .initial("sample")
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        machine.run(test_vehicle()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(count.load(Ordering::SeqCst) > 1, "body should re-invoke");
    }

    #[tokio::test]
    async fn timed_state_without_loop_waits_out_duration() {
        let machine = StateMachine::builder()
            .timed_state("pause", Duration::from_millis(200), false, |_v| async {
                Ok(Transition::Done)
            })
            .initial("pause")
            .build()
            .unwrap();
        let started = std::time::Instant::now();
        machine.run(test_vehicle()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn background_error_terminates_mission() {
        let machine = StateMachine::builder()
            .state("forever", |_v| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Transition::to("forever"))
            })
            .background(|_v| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                anyhow::bail!("sensor died")
            })
            .initial("forever")
            .build()
            .unwrap();

        let err = machine
            .run(test_vehicle())
            .await
            .expect_err("background failure must end the mission");
        assert!(format!("{err:#}").contains("sensor died"));
    }

    #[tokio::test]
    async fn at_init_runs_before_first_state() {
        let trace: StdArc<std::sync::Mutex<Vec<&'static str>>> = StdArc::default();
        let t1 = trace.clone();
        let t2 = trace.clone();
        let machine = StateMachine::builder()
            .at_init(move |_v| {
                let t = t1.clone();
                async move {
                    t.lock().unwrap().push("init");
                    Ok(())
                }
            })
            .state("only", move |_v| {
                let t = t2.clone();
                async move {
                    t.lock().unwrap().push("state");
                    Ok(Transition::Done)
                }
            })
            .initial("only")
            .build()
            .unwrap();
        machine.run(test_vehicle()).await.unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!["init", "state"]);
    }

    #[tokio::test]
    async fn unknown_transition_is_an_error() {
        let machine = StateMachine::builder()
            .state("start", |_v| async { Ok(Transition::to("nowhere")) })
            .initial("start")
            .build()
            .unwrap();
        let err = machine.run(test_vehicle()).await.unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn builder_requires_a_known_initial_state() {
        let missing = StateMachine::builder()
            .state("a", |_v| async { Ok(Transition::Done) })
            .build();
        assert!(matches!(missing, Err(MissionError::NoInitialState)));

        let unknown = StateMachine::builder()
            .state("a", |_v| async { Ok(Transition::Done) })
            .initial("b")
            .build();
        assert!(matches!(unknown, Err(MissionError::UnknownInitialState(_))));
    }
}
