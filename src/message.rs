//! The invocation record passed between the scheduler and the module host.

/// A single function invocation.
///
/// `func_ptr` selects the entrypoint: `0` runs the module's `_start`, a
/// positive value is an index into the indirect call table. The `omp_*`
/// fields describe a distributed OpenMP fork when `omp_depth > 0`.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub user: String,
    pub function: String,
    pub input_data: Vec<u8>,
    pub func_ptr: i32,
    pub omp_depth: i32,
    pub omp_eff_depth: i32,
    pub omp_max_active_levels: i32,
    pub omp_num_threads: i32,
    pub omp_thread_num: i32,
    pub omp_function_args: Vec<i32>,
    pub return_value: i32,
}

impl Message {
    pub fn new(user: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            function: function.into(),
            ..Default::default()
        }
    }

    /// Canonical `user/function` identity string.
    pub fn func_str(&self) -> String {
        format!("{}/{}", self.user, self.function)
    }
}
