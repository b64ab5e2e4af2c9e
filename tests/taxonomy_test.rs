use warden_nvr::error::StderrClass;
use warden_nvr::taxonomy::classify;

#[test]
fn unreachable_takes_priority_over_a_generic_warning_shape() {
    let line = "[tcp @ 0x7f1] Connection to tcp://192.168.1.50:554 failed: Connection refused";
    assert!(matches!(classify(line), StderrClass::Unreachable(_)));
}

#[test]
fn unrelated_ffmpeg_progress_lines_are_warnings() {
    let line = "Stream mapping:\n  Stream #0:0 -> #0:0 (copy)";
    assert!(matches!(classify(line), StderrClass::Warning(_)));
}
