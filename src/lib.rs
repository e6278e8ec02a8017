//! Driver for the MCP3426 2-channel I2C analog-to-digital converter.
//!
//! # Description
//! This driver targets power-monitor boards that feed a divided-down voltage into channel 1 and
//! the drop across a current shunt into channel 2. Conversions are triggered in one-shot mode and
//! decoded into engineering units using the divider and shunt values supplied at configuration
//! time.
//!
//! The MCP3427 and MCP3428 share the register layout; channels 3 and 4 are only wired on the
//! MCP3428.
#![no_std]
#![deny(warnings)]

use bit_field::BitField;
use embedded_hal::i2c::I2c;

// The factory-programmed address of the MCP3426. Other family members use 0x68 through 0x6F
// depending on the A0/A1 pin strapping.
const DEVICE_ADDRESS: u8 = 0x68;

// The differential full-scale input range of the converter at unity gain, in volts.
const FULL_SCALE_VOLTS: f32 = 2.048;

// The number of data-phase reads a blocking conversion performs before giving up. An 18-bit
// conversion completes within 267ms, so this is generous on any realistic bus.
const READ_ATTEMPTS: u32 = 4096;

/// Indicates an ADC input channel. The value corresponds to the channel-select field of the
/// configuration register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Channel {
    One = 0b00,
    Two = 0b01,
    Three = 0b10,
    Four = 0b11,
}

impl Channel {
    fn index(self) -> usize {
        self as usize
    }
}

/// The programmable gain of the input amplifier. The value corresponds to the gain field of the
/// configuration register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Gain {
    G1 = 0b00,
    G2 = 0b01,
    G4 = 0b10,
    G8 = 0b11,
}

impl Gain {
    /// Decode a gain from the two-bit field of a configuration byte.
    pub fn from_bits(bits: u8) -> Gain {
        match bits & 0b11 {
            0b00 => Gain::G1,
            0b01 => Gain::G2,
            0b10 => Gain::G4,
            _ => Gain::G8,
        }
    }

    /// Get the amplification factor of the gain setting.
    pub fn factor(self) -> u8 {
        1 << self as u8
    }
}

/// The conversion resolution. The value corresponds to the sample-size field of the configuration
/// register; lower resolutions convert faster (240sps at 12 bits, 3.75sps at 18 bits).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    TwelveBit = 0b00,
    FourteenBit = 0b01,
    SixteenBit = 0b10,
    EighteenBit = 0b11,
}

impl Resolution {
    /// Decode a resolution from the two-bit field of a configuration byte.
    pub fn from_bits(bits: u8) -> Resolution {
        match bits & 0b11 {
            0b00 => Resolution::TwelveBit,
            0b01 => Resolution::FourteenBit,
            0b10 => Resolution::SixteenBit,
            _ => Resolution::EighteenBit,
        }
    }

    /// Get the number of bits in a conversion result.
    pub fn bits(self) -> u8 {
        12 + 2 * self as u8
    }

    /// Get the input voltage represented by one output code at unity gain.
    pub fn step_size(self) -> f32 {
        FULL_SCALE_VOLTS / (1u32 << (self.bits() - 1)) as f32
    }

    // The number of data bytes preceding the status byte during the read phase.
    fn data_bytes(self) -> usize {
        match self {
            Resolution::EighteenBit => 3,
            _ => 2,
        }
    }
}

/// The conversion trigger behavior encoded in the mode bit of the configuration register. This
/// driver always triggers in one-shot mode; the continuous encoding is provided for interpreting
/// read-back configuration bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConversionMode {
    OneShot = 0,
    Continuous = 1,
}

/// Represents possible errors from the ADC driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error<E> {
    Interface(E),
    Bounds,
    Timeout,
}

impl<E> From<E> for Error<E> {
    fn from(err: E) -> Error<E> {
        Error::Interface(err)
    }
}

// Cached per-channel conversion settings. The configuration byte is shadowed so that a
// conversion can be retriggered without respecifying all fields, and the gain factor is kept
// alongside for the unit-conversion math.
#[derive(Copy, Clone)]
struct ChannelState {
    config: u8,
    gain: Gain,
}

/// A driver for the MCP3426 analog-to-digital converter.
pub struct Mcp3426<I2C>
where
    I2C: I2c,
{
    i2c: I2C,
    address: u8,
    channels: [ChannelState; 4],
    divider_ratio: f32,
    shunt_ohms: f32,
}

impl<I2C> Mcp3426<I2C>
where
    I2C: I2c,
{
    /// Construct a driver for the ADC.
    ///
    /// # Args
    /// * `i2c` - The I2C bus used to communicate with the device.
    /// * `address` - The 7-bit I2C address of the device (0x68 through 0x6F).
    pub fn new(i2c: I2C, address: u8) -> Self {
        Mcp3426 {
            i2c,
            address,
            channels: [ChannelState {
                config: 0,
                gain: Gain::G1,
            }; 4],
            divider_ratio: 0.0,
            shunt_ohms: 0.0,
        }
    }

    /// Construct a driver for an ADC at the factory-default address.
    ///
    /// # Args
    /// * `i2c` - The I2C bus used to communicate with the device.
    pub fn default(i2c: I2C) -> Self {
        Mcp3426::new(i2c, DEVICE_ADDRESS)
    }

    /// Deconstruct the driver, releasing the I2C bus.
    pub fn free(self) -> I2C {
        self.i2c
    }

    /// Check that the device acknowledges its address on the bus.
    ///
    /// # Returns
    /// True if the device responded. A false result indicates a wiring or addressing problem and
    /// is not retried internally.
    pub fn test_connection(&mut self) -> bool {
        let mut config: [u8; 1] = [0];
        self.i2c.read(self.address, &mut config).is_ok()
    }

    /// Configure channel 1 for a divided-down voltage measurement.
    ///
    /// # Args
    /// * `v_max` - The largest input voltage the divider is expected to see, in volts.
    /// * `r_up` - The upper divider resistor. Any unit, as long as it matches `r_up`.
    /// * `r_down` - The lower divider resistor, across which the ADC measures.
    ///
    /// # Returns
    /// An error if the divider values are not physically meaningful.
    pub fn set_voltage_divider(
        &mut self,
        v_max: f32,
        r_up: f32,
        r_down: f32,
    ) -> Result<(), Error<I2C::Error>> {
        if v_max <= 0.0 || r_up < 0.0 || r_down <= 0.0 {
            return Err(Error::Bounds);
        }

        let ratio = (r_up + r_down) / r_down;
        self.divider_ratio = ratio;
        self.set_gain(Channel::One, Self::gain_for(v_max / ratio));

        Ok(())
    }

    /// Configure channel 2 for a shunt current measurement.
    ///
    /// # Args
    /// * `i_max` - The largest current expected through the shunt, in amps.
    /// * `shunt` - The shunt resistance, in ohms.
    ///
    /// # Returns
    /// An error if the shunt values are not physically meaningful.
    pub fn set_current_shunt(&mut self, i_max: f32, shunt: f32) -> Result<(), Error<I2C::Error>> {
        if i_max <= 0.0 || shunt <= 0.0 {
            return Err(Error::Bounds);
        }

        self.shunt_ohms = shunt;
        self.set_gain(Channel::Two, Self::gain_for(i_max * shunt));

        Ok(())
    }

    /// Select the conversion resolution for a channel.
    ///
    /// # Note
    /// Channels default to 12-bit conversions until configured otherwise.
    pub fn set_resolution(&mut self, channel: Channel, resolution: Resolution) {
        self.channels[channel.index()]
            .config
            .set_bits(2..4, resolution as u8);
    }

    /// Get the cached configuration byte for a channel. Performs no bus traffic.
    pub fn config_register(&self, channel: Channel) -> u8 {
        self.channels[channel.index()].config
    }

    // Select the largest gain that keeps the amplified input within the reference range.
    fn gain_for(input_volts: f32) -> Gain {
        if input_volts * 8.0 <= FULL_SCALE_VOLTS {
            Gain::G8
        } else if input_volts * 4.0 <= FULL_SCALE_VOLTS {
            Gain::G4
        } else if input_volts * 2.0 <= FULL_SCALE_VOLTS {
            Gain::G2
        } else {
            Gain::G1
        }
    }

    fn set_gain(&mut self, channel: Channel, gain: Gain) {
        let state = &mut self.channels[channel.index()];
        state.gain = gain;
        state.config.set_bits(0..2, gain as u8);
    }

    /// Trigger a one-shot conversion on a channel.
    ///
    /// # Args
    /// * `channel` - The channel to convert.
    pub fn start_conversion(&mut self, channel: Channel) -> Result<(), Error<I2C::Error>> {
        let mut config = self.channels[channel.index()].config;
        config.set_bits(5..7, channel as u8);
        config.set_bits(4..5, ConversionMode::OneShot as u8);

        // Writing the RDY bit in one-shot mode initiates the conversion.
        config.set_bit(7, true);

        self.i2c.write(self.address, &[config])?;
        self.channels[channel.index()].config = config;

        Ok(())
    }

    /// Check for a completed conversion without blocking.
    ///
    /// # Args
    /// * `channel` - The channel the pending conversion was started on.
    ///
    /// # Returns
    /// The signed conversion result, or `None` if the conversion has not completed yet and the
    /// caller should poll again later.
    pub fn check_conversion(&mut self, channel: Channel) -> Result<Option<i32>, Error<I2C::Error>> {
        let resolution = Resolution::from_bits(self.channels[channel.index()].config.get_bits(2..4));

        let mut buffer: [u8; 4] = [0; 4];
        let length = resolution.data_bytes() + 1;
        self.i2c.read(self.address, &mut buffer[..length])?;

        // The device appends its configuration register to the sample bytes. Its RDY bit reads 1
        // while a conversion is still in progress.
        let status = buffer[length - 1];
        self.channels[channel.index()].config = status;

        if status.get_bit(7) {
            return Ok(None);
        }

        let code = match resolution {
            // The device sign-extends the upper data byte of an 18-bit result.
            Resolution::EighteenBit => {
                (i32::from(buffer[0] as i8) << 16)
                    | (i32::from(buffer[1]) << 8)
                    | i32::from(buffer[2])
            }
            _ => i32::from(i16::from_be_bytes([buffer[0], buffer[1]])),
        };

        Ok(Some(code))
    }

    /// Wait for a conversion to complete and return its result.
    ///
    /// # Args
    /// * `channel` - The channel the pending conversion was started on.
    ///
    /// # Returns
    /// The signed conversion result, or a timeout error if the device never reported completion.
    pub fn read_conversion(&mut self, channel: Channel) -> Result<i32, Error<I2C::Error>> {
        for _ in 0..READ_ATTEMPTS {
            if let Some(code) = self.check_conversion(channel)? {
                return Ok(code);
            }
        }

        Err(Error::Timeout)
    }

    /// Measure the voltage at the top of the channel-1 divider.
    ///
    /// # Note
    /// The divider must have been configured with [`Mcp3426::set_voltage_divider`] first.
    ///
    /// # Returns
    /// The measured input voltage in volts.
    pub fn read_input_voltage(&mut self) -> Result<f32, Error<I2C::Error>> {
        if self.divider_ratio <= 0.0 {
            return Err(Error::Bounds);
        }

        let volts = self.read_channel_volts(Channel::One)?;
        Ok(volts * self.divider_ratio)
    }

    /// Measure the current through the channel-2 shunt.
    ///
    /// # Note
    /// The shunt must have been configured with [`Mcp3426::set_current_shunt`] first.
    ///
    /// # Returns
    /// The measured current in milliamps.
    pub fn read_load_current(&mut self) -> Result<f32, Error<I2C::Error>> {
        if self.shunt_ohms <= 0.0 {
            return Err(Error::Bounds);
        }

        let volts = self.read_channel_volts(Channel::Two)?;
        Ok(volts / self.shunt_ohms * 1000.0)
    }

    // Run a blocking one-shot conversion and scale the result to volts at the ADC input.
    fn read_channel_volts(&mut self, channel: Channel) -> Result<f32, Error<I2C::Error>> {
        let state = self.channels[channel.index()];
        let resolution = Resolution::from_bits(state.config.get_bits(2..4));

        self.start_conversion(channel)?;
        let code = self.read_conversion(channel)?;

        Ok(code as f32 * resolution.step_size() / state.gain.factor() as f32)
    }
}
