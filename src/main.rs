use leakscope::TrackerConfig;

fn main() {
  env_logger::init();

  leakscope::install(
    TrackerConfig::default().with_wild_pointer_reports(true),
  );

  // Dropping the guard at the end of main generates and opens the final
  // report, since `report_on_exit` is set.
  let _guard = leakscope::exit_guard();

  leakscope::watch(0x1000, 128);
  leakscope::watch(0x2000, 64);
  leakscope::watch(0x3000, 256);
  leakscope::forget(0x2000);

  // A deallocation nobody registered.
  leakscope::forget(0xBAD);

  let stats = leakscope::summary();

  println!("=== demo summary ===");
  println!(
    "leaks={} usage={}B peak={}B",
    stats.leaks, stats.usage, stats.peak
  );

  match leakscope::report() {
    Ok(path) => println!("leak report written to {}", path.display()),
    Err(err) => eprintln!("leak report failed: {err}"),
  }
}
