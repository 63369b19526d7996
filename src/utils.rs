/// Parse `"x,y,z"` into three values
pub fn parse_triplet<T: std::str::FromStr>(s: &str) -> Result<[T; 3], String>
where
    <T as std::str::FromStr>::Err: std::fmt::Display,
{
    let v = s.split(',').map(str::trim).collect::<Vec<_>>();
    if v.len() != 3 {
        return Err(format!("expected 3 comma-separated values, found {}: `{s}`", v.len()));
    }
    let parse = |x: &str| x.parse::<T>().map_err(|e| format!("`{x}`: {e}"));
    Ok([parse(v[0])?, parse(v[1])?, parse(v[2])?])
}

/// Parse `"x,y"` into two values
pub fn parse_pair<T: std::str::FromStr>(s: &str) -> Result<[T; 2], String>
where
    <T as std::str::FromStr>::Err: std::fmt::Display,
{
    let v = s.split(',').map(str::trim).collect::<Vec<_>>();
    if v.len() != 2 {
        return Err(format!("expected 2 comma-separated values, found {}: `{s}`", v.len()));
    }
    let parse = |x: &str| x.parse::<T>().map_err(|e| format!("`{x}`: {e}"));
    Ok([parse(v[0])?, parse(v[1])?])
}

/// Group numeric digits to facilitate reading long numbers
pub fn group_digits<F: std::fmt::Display>(n: F) -> String {
    use numsep::{separate, Locale};
    separate(n, Locale::English)
}


pub mod timing {

    use super::group_digits;
    use std::time::Instant;
    use std::io::Write;

    pub struct Progress {
        previous: Instant,
    }

    impl Progress {

        #[allow(clippy::new_without_default)]
        pub fn new() -> Self { Self { previous: Instant::now() } }

        /// Print message, append ellipsis, flush stdout, stay on same line, start timer.
        pub fn start(&mut self, message: &str) {
            print!("{message} ... ");
            // Nothing useful can be done if stdout is gone
            let _ = std::io::stdout().flush();
            self.start_timer();
        }

        // Print time elapsed since last start or done
        pub fn done(&mut self) {
            println!("{} ms", group_digits(self.previous.elapsed().as_millis()));
            self.start_timer();
        }

        // Print message followed by time elapsed since last start or done
        pub fn done_with_message(&mut self, message: &str) {
            println!("{message}: {} ms",
                     group_digits(self.previous.elapsed().as_millis()));
            self.start_timer();
        }

        fn start_timer(&mut self) { self.previous = Instant::now() }
    }
}
