use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chanio::{
    Channel, Direction, GpioConfig, GpioError, GpioManager, Level, MockGpioBackend,
    NumberingMode, Pull,
};

const LED: u32 = 18;

fn setup() -> (GpioManager<MockGpioBackend>, Arc<MockGpioBackend>) {
    let backend = Arc::new(MockGpioBackend::default());
    let gpio = GpioManager::new(&GpioConfig::default(), backend.clone());
    gpio.set_mode(NumberingMode::Bcm);
    gpio.configure(LED, Direction::Out, Pull::Off, None).unwrap();
    (gpio, backend)
}

fn writes(backend: &MockGpioBackend) -> Vec<Level> {
    backend.writes(Channel::from_line(LED)).unwrap()
}

fn wait_for_level(backend: &MockGpioBackend, level: Level) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if backend.level(Channel::from_line(LED)).unwrap() == level {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn generator_needs_an_output() {
    let (gpio, _) = setup();
    assert!(matches!(
        gpio.pwm(24, 50.0),
        Err(GpioError::NotConfiguredAsOutput(_))
    ));

    gpio.configure(24, Direction::In, Pull::Off, None).unwrap();
    assert!(matches!(
        gpio.pwm(24, 50.0),
        Err(GpioError::NotConfiguredAsOutput(_))
    ));
}

#[test]
fn parameters_are_validated() {
    let (gpio, _) = setup();
    assert!(matches!(
        gpio.pwm(LED, 0.0),
        Err(GpioError::InvalidFrequency(_))
    ));
    assert!(matches!(
        gpio.pwm(LED, -5.0),
        Err(GpioError::InvalidFrequency(_))
    ));

    let pwm = gpio.pwm(LED, 50.0).unwrap();
    assert!(matches!(
        pwm.start(100.1),
        Err(GpioError::InvalidDutyCycle(_))
    ));
    assert!(matches!(
        pwm.change_duty_cycle(-1.0),
        Err(GpioError::InvalidDutyCycle(_))
    ));
    assert!(matches!(
        pwm.change_frequency(0.0),
        Err(GpioError::InvalidFrequency(_))
    ));
    assert!(!pwm.status().unwrap().running);
}

#[test]
fn frequencies_too_low_to_time_are_rejected() {
    let (gpio, backend) = setup();
    assert!(matches!(
        gpio.pwm(LED, 1e-30),
        Err(GpioError::InvalidFrequency(_))
    ));

    let pwm = gpio.pwm(LED, 50.0).unwrap();
    pwm.start(50.0).unwrap();
    assert!(matches!(
        pwm.change_frequency(1e-30),
        Err(GpioError::InvalidFrequency(_))
    ));
    let status = pwm.status().unwrap();
    assert_eq!(status.frequency_hz, 50.0);
    assert!(status.running);
    assert!(wait_for_level(&backend, Level::High));
    assert!(wait_for_level(&backend, Level::Low));
    pwm.close().unwrap();
}

#[test]
fn one_generator_per_channel() {
    let (gpio, _) = setup();
    let pwm = gpio.pwm(LED, 50.0).unwrap();
    assert!(matches!(
        gpio.pwm(LED, 60.0),
        Err(GpioError::PwmAlreadyExists(_))
    ));

    pwm.close().unwrap();
    let again = gpio.pwm(LED, 60.0).unwrap();
    assert_eq!(again.status().unwrap().frequency_hz, 60.0);
}

#[test]
fn half_duty_toggles_the_line() {
    let (gpio, backend) = setup();
    let pwm = gpio.pwm(LED, 100.0).unwrap();
    pwm.start(50.0).unwrap();
    thread::sleep(Duration::from_millis(100));
    let seen = writes(&backend);
    pwm.stop().unwrap();

    assert!(seen.contains(&Level::High));
    assert!(seen.contains(&Level::Low));
    // only changes are written
    assert!(seen.windows(2).all(|w| w[0] != w[1]));
}

#[test]
fn full_duty_never_goes_low_after_the_change() {
    let (gpio, backend) = setup();
    let pwm = gpio.pwm(LED, 100.0).unwrap();
    pwm.start(50.0).unwrap();
    thread::sleep(Duration::from_millis(100));

    pwm.change_duty_cycle(100.0).unwrap();
    // let the period in progress finish
    thread::sleep(Duration::from_millis(30));
    let settled = writes(&backend).len();
    assert!(wait_for_level(&backend, Level::High));

    thread::sleep(Duration::from_millis(200));
    let after = writes(&backend);
    assert!(!after[settled..].contains(&Level::Low));
    assert_eq!(backend.level(Channel::from_line(LED)).unwrap(), Level::High);
    assert!(pwm.status().unwrap().running);
}

#[test]
fn zero_duty_holds_low() {
    let (gpio, backend) = setup();
    let pwm = gpio.pwm(LED, 200.0).unwrap();
    pwm.start(0.0).unwrap();
    thread::sleep(Duration::from_millis(50));

    assert!(!writes(&backend).contains(&Level::High));
    assert!(pwm.status().unwrap().running);
}

#[test]
fn stop_leaves_the_line_low() {
    let (gpio, backend) = setup();
    let pwm = gpio.pwm(LED, 10.0).unwrap();
    pwm.start(100.0).unwrap();
    assert!(wait_for_level(&backend, Level::High));

    pwm.stop().unwrap();
    assert_eq!(backend.level(Channel::from_line(LED)).unwrap(), Level::Low);
    assert!(!pwm.status().unwrap().running);

    let count = writes(&backend).len();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(writes(&backend).len(), count);
}

#[test]
fn restart_only_updates_duty_cycle() {
    let (gpio, _) = setup();
    let pwm = gpio.pwm(LED, 50.0).unwrap();
    pwm.start(10.0).unwrap();
    pwm.start(75.0).unwrap();
    pwm.change_frequency(20.0).unwrap();

    let status = pwm.status().unwrap();
    assert!(status.running);
    assert_eq!(status.duty_cycle, 75.0);
    assert_eq!(status.frequency_hz, 20.0);

    let listed = gpio.channels();
    assert_eq!(listed[0].pwm, Some(status));
}

#[test]
fn handle_drop_keeps_generator_running() {
    let (gpio, backend) = setup();
    {
        let pwm = gpio.pwm(LED, 10.0).unwrap();
        pwm.start(100.0).unwrap();
    }
    assert!(wait_for_level(&backend, Level::High));

    let pwm = gpio.existing_pwm(LED).unwrap();
    assert!(pwm.status().unwrap().running);
}

#[test]
fn cleanup_stops_the_generator() {
    let (gpio, backend) = setup();
    let pwm = gpio.pwm(LED, 100.0).unwrap();
    pwm.start(50.0).unwrap();
    thread::sleep(Duration::from_millis(50));

    assert_eq!(gpio.cleanup(Some(LED)).unwrap(), 1);
    assert!(matches!(
        pwm.status(),
        Err(GpioError::NotConfiguredAsOutput(_))
    ));

    let count = writes(&backend).len();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(writes(&backend).len(), count);
    assert_eq!(writes(&backend).last(), Some(&Level::Low));
}

#[test]
fn switching_to_input_stops_the_generator() {
    let (gpio, _) = setup();
    let pwm = gpio.pwm(LED, 100.0).unwrap();
    pwm.start(50.0).unwrap();

    gpio.configure(LED, Direction::In, Pull::Off, None).unwrap();
    assert!(matches!(
        gpio.existing_pwm(LED),
        Err(GpioError::NotConfiguredAsOutput(_))
    ));
}
