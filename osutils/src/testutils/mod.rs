mod fake_platform;

pub use fake_platform::FakePlatform;
