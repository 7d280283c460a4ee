/// Log how long a phase took, at the given `log` level.
///
/// ```ignore
/// let cfg = time_phase!(debug, "cfg construction", { build(prog)? });
/// ```
macro_rules! time_phase {
    ($level:ident, $name:expr, $f:block) => {{
        let start = std::time::Instant::now();
        let result = $f;
        log::$level!("{} finished in {:?}", $name, start.elapsed());
        result
    }};
}
