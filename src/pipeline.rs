//! Ordered composition of fallible stages.
//!
//! A [`Pipeline`] threads a value through a chain of functions, feeding
//! each stage's output into the next. The first stage that returns `Err`
//! ends the run: its error becomes the pipeline's result and no later
//! stage executes. Errors are values; nothing panics or unwinds.
//!
//! ```text
//! input ─▶ stage 1 ─▶ stage 2 ─▶ … ─▶ Ok(output)
//!             │          │
//!             └──────────┴──────────▶ Err(first error)
//! ```

/// A boxed stage from `I` to `Result<O, E>`.
type Stage<'a, I, O, E> = Box<dyn Fn(I) -> Result<O, E> + Send + Sync + 'a>;

/// A typed chain of fallible stages.
///
/// Each call to [`then`](Pipeline::then) changes the output type, so
/// stages with different input and output types compose without a shared
/// context struct.
///
/// # Examples
///
/// ```
/// use eventfold_dispatch::Pipeline;
///
/// let parse_then_double = Pipeline::<&str, &str, String>::new()
///     .then(|s: &str| s.parse::<i32>().map_err(|e| e.to_string()))
///     .then(|n| Ok(n * 2));
///
/// assert_eq!(parse_then_double.run("21"), Ok(42));
/// assert!(parse_then_double.run("x").is_err());
/// ```
pub struct Pipeline<'a, I, O, E> {
    run: Stage<'a, I, O, E>,
}

impl<'a, I: 'a, E: 'a> Pipeline<'a, I, I, E> {
    /// The identity pipeline: returns its input unchanged.
    pub fn new() -> Self {
        Self {
            run: Box::new(Ok),
        }
    }
}

impl<'a, I: 'a, E: 'a> Default for Pipeline<'a, I, I, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, I: 'a, O: 'a, E: 'a> Pipeline<'a, I, O, E> {
    /// Append a stage. It runs only if every earlier stage succeeded.
    pub fn then<N, F>(self, stage: F) -> Pipeline<'a, I, N, E>
    where
        N: 'a,
        F: Fn(O) -> Result<N, E> + Send + Sync + 'a,
    {
        let previous = self.run;
        Pipeline {
            run: Box::new(move |input| previous(input).and_then(&stage)),
        }
    }

    /// Thread `input` through every stage.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing stage.
    pub fn run(&self, input: I) -> Result<O, E> {
        (self.run)(input)
    }
}

/// Compose same-typed stages into one function, applied in order.
///
/// An empty list yields the identity.
///
/// # Examples
///
/// ```
/// use eventfold_dispatch::compose;
///
/// let add_then_halve = compose::<i32, &str>(vec![
///     Box::new(|n: i32| Ok(n + 2)),
///     Box::new(|n: i32| if n % 2 == 0 { Ok(n / 2) } else { Err("odd") }),
/// ]);
/// assert_eq!(add_then_halve(4), Ok(3));
/// assert_eq!(add_then_halve(3), Err("odd"));
/// ```
pub fn compose<'a, T, E>(
    stages: Vec<Box<dyn Fn(T) -> Result<T, E> + Send + Sync + 'a>>,
) -> impl Fn(T) -> Result<T, E> + Send + Sync + 'a
where
    T: 'a,
    E: 'a,
{
    move |input| stages.iter().try_fold(input, |value, stage| stage(value))
}
